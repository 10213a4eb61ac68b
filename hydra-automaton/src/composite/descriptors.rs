//! Registration records built by parts at startup.

use crate::error::{AutomatonError, Result};
use crate::mutation::MutationContext;
use crate::serialize::{
    AsyncSerializationPriority, LoadContext, SaveContext, SyncSerializationPriority,
};
use std::collections::HashMap;

/// Deferred half of an async saver, run off the automaton context.
pub type AsyncSaveContinuation = Box<dyn FnOnce(&mut SaveContext) -> Result<()> + Send>;

pub(crate) type SaverFn = Box<dyn Fn(&mut SaveContext) -> Result<()> + Send + Sync>;
pub(crate) type AsyncSaverFn = Box<dyn Fn() -> Result<AsyncSaveContinuation> + Send + Sync>;
pub(crate) type LoaderFn = Box<dyn Fn(&mut LoadContext) -> Result<()> + Send + Sync>;
pub(crate) type MethodFn = Box<dyn Fn(&mut MutationContext) -> Result<()> + Send + Sync>;

pub(crate) struct SyncSaverDescriptor {
    pub name: String,
    pub part: String,
    pub priority: SyncSerializationPriority,
    pub callback: SaverFn,
}

pub(crate) struct AsyncSaverDescriptor {
    pub name: String,
    pub part: String,
    pub priority: AsyncSerializationPriority,
    pub callback: AsyncSaverFn,
}

pub(crate) struct LoaderDescriptor {
    pub part: String,
    pub callback: LoaderFn,
}

pub(crate) struct MethodDescriptor {
    pub part: String,
    pub profiling_tag: String,
    pub callback: MethodFn,
}

/// Lookup tables owned by the composite automaton.
#[derive(Default)]
pub(crate) struct Registrations {
    /// In registration order.
    pub sync_savers: Vec<SyncSaverDescriptor>,
    /// In registration order.
    pub async_savers: Vec<AsyncSaverDescriptor>,
    pub loaders: HashMap<String, LoaderDescriptor>,
    pub methods: HashMap<String, MethodDescriptor>,
}

impl Registrations {
    fn has_saver(&self, name: &str) -> bool {
        self.sync_savers.iter().any(|s| s.name == name)
            || self.async_savers.iter().any(|s| s.name == name)
    }
}

fn duplicate(kind: &'static str, name: &str, part: &str) -> AutomatonError {
    AutomatonError::DuplicateRegistration {
        kind,
        name: name.to_string(),
        part: part.to_string(),
    }
}

/// Handle through which a part contributes savers, loaders and mutation
/// handlers during [`CompositeAutomaton::register_part`].
///
/// Names are global across the composite. Prefixing them with the part name
/// (`"tablets.keys"`) keeps parts from colliding.
///
/// [`CompositeAutomaton::register_part`]: super::CompositeAutomaton::register_part
pub struct PartRegistrar<'a> {
    part: &'a str,
    tables: &'a mut Registrations,
}

impl<'a> PartRegistrar<'a> {
    pub(crate) fn new(part: &'a str, tables: &'a mut Registrations) -> Self {
        Self { part, tables }
    }

    /// Name of the registering part.
    pub fn part_name(&self) -> &str {
        self.part
    }

    /// Register a saver run on the automaton context during the synchronous
    /// save phase.
    pub fn register_saver<F>(
        &mut self,
        name: impl Into<String>,
        priority: SyncSerializationPriority,
        saver: F,
    ) -> Result<()>
    where
        F: Fn(&mut SaveContext) -> Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.tables.has_saver(&name) {
            return Err(duplicate("saver", &name, self.part));
        }
        self.tables.sync_savers.push(SyncSaverDescriptor {
            name,
            part: self.part.to_string(),
            priority,
            callback: Box::new(saver),
        });
        Ok(())
    }

    /// Register an async saver.
    ///
    /// `saver` runs inline during the synchronous phase and must capture
    /// whatever state it needs into the returned continuation. The
    /// continuation runs later on a blocking worker, concurrently with
    /// mutation processing.
    pub fn register_async_saver<F>(
        &mut self,
        name: impl Into<String>,
        priority: AsyncSerializationPriority,
        saver: F,
    ) -> Result<()>
    where
        F: Fn() -> Result<AsyncSaveContinuation> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.tables.has_saver(&name) {
            return Err(duplicate("saver", &name, self.part));
        }
        self.tables.async_savers.push(AsyncSaverDescriptor {
            name,
            part: self.part.to_string(),
            priority,
            callback: Box::new(saver),
        });
        Ok(())
    }

    /// Register the loader for the section called `name`.
    pub fn register_loader<F>(&mut self, name: impl Into<String>, loader: F) -> Result<()>
    where
        F: Fn(&mut LoadContext) -> Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.tables.loaders.contains_key(&name) {
            return Err(duplicate("loader", &name, self.part));
        }
        self.tables.loaders.insert(
            name,
            LoaderDescriptor {
                part: self.part.to_string(),
                callback: Box::new(loader),
            },
        );
        Ok(())
    }

    /// Register the handler for `mutation_type`.
    pub fn register_method<F>(&mut self, mutation_type: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(&mut MutationContext) -> Result<()> + Send + Sync + 'static,
    {
        let mutation_type = mutation_type.into();
        let tag = mutation_type.clone();
        self.register_method_with_tag(mutation_type, tag, handler)
    }

    /// Register the handler for `mutation_type`, recording its applies under
    /// `profiling_tag`.
    pub fn register_method_with_tag<F>(
        &mut self,
        mutation_type: impl Into<String>,
        profiling_tag: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(&mut MutationContext) -> Result<()> + Send + Sync + 'static,
    {
        let mutation_type = mutation_type.into();
        if self.tables.methods.contains_key(&mutation_type) {
            return Err(duplicate("method", &mutation_type, self.part));
        }
        self.tables.methods.insert(
            mutation_type,
            MethodDescriptor {
                part: self.part.to_string(),
                profiling_tag: profiling_tag.into(),
                callback: Box::new(handler),
            },
        );
        Ok(())
    }
}
