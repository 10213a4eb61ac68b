//! Composite automaton: the ordered set of parts and their registrations.

mod descriptors;
mod part;

pub use descriptors::{AsyncSaveContinuation, PartRegistrar};
pub use part::{AutomatonPart, PartEvent};

use crate::AutomatonFuture;
use crate::error::{AutomatonError, Result};
use crate::mutation::MutationContext;
use crate::serialize::checkpoint;
use crate::serialize::{LoadContext, SNAPSHOT_FORMAT_VERSION, SaveContext, SectionKind};
use crate::store::SnapshotWriter;
use descriptors::Registrations;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, trace_span, warn};

/// Owns the parts and dispatches whole-state operations to them.
///
/// Parts are registered once at startup through `&mut self`; afterwards the
/// composite is shared read-only.
#[derive(Default)]
pub struct CompositeAutomaton {
    parts: Vec<Arc<dyn AutomatonPart>>,
    registrations: Registrations,
}

impl CompositeAutomaton {
    /// Create an empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a part and let it register its handlers.
    pub fn register_part(&mut self, part: Arc<dyn AutomatonPart>) -> Result<()> {
        let name = part.name().to_string();
        if self.parts.iter().any(|p| p.name() == name) {
            return Err(AutomatonError::DuplicateRegistration {
                kind: "part",
                name: name.clone(),
                part: name,
            });
        }

        let mut registrar = PartRegistrar::new(&name, &mut self.registrations);
        Arc::clone(&part).register(&mut registrar)?;
        self.parts.push(part);

        debug!(part = %name, "Registered automaton part");
        Ok(())
    }

    /// Registered parts in registration order.
    pub fn parts(&self) -> &[Arc<dyn AutomatonPart>] {
        &self.parts
    }

    /// Whether a handler exists for `mutation_type`.
    pub fn has_method(&self, mutation_type: &str) -> bool {
        self.registrations.methods.contains_key(mutation_type)
    }

    /// Reset every part, in registration order.
    pub fn clear(&self) {
        for part in &self.parts {
            part.clear();
        }
    }

    /// Forward a lifecycle notification to every part, in registration order.
    pub fn notify(&self, event: PartEvent) {
        for part in &self.parts {
            event.deliver(part.as_ref());
        }
    }

    /// Serialize the whole state into `writer`.
    ///
    /// Sync savers (all `Keys` first, then all `Values`, each class in
    /// registration order) and the capture step of every async saver run
    /// before this method returns. The returned future runs the async
    /// continuations on a blocking worker and yields the writer once the
    /// stream is complete; it does not close the writer.
    pub fn save_snapshot(
        &self,
        writer: Box<dyn SnapshotWriter>,
    ) -> AutomatonFuture<'static, Box<dyn SnapshotWriter>> {
        let captured = self.save_sync_phase(writer);

        Box::pin(async move {
            let (mut context, continuations) = captured?;
            if continuations.is_empty() {
                return context.finish();
            }

            tokio::task::spawn_blocking(move || {
                for (name, continuation) in continuations {
                    context.begin_section(&name, SectionKind::Async)?;
                    continuation(&mut context).map_err(|e| saver_failed(&name, e))?;
                    context.end_section()?;
                }
                context.finish()
            })
            .await?
        })
    }

    fn save_sync_phase(
        &self,
        writer: Box<dyn SnapshotWriter>,
    ) -> Result<(SaveContext, Vec<(String, AsyncSaveContinuation)>)> {
        let mut context = SaveContext::new(writer, SNAPSHOT_FORMAT_VERSION)?;

        let mut savers: Vec<_> = self.registrations.sync_savers.iter().collect();
        savers.sort_by_key(|s| s.priority);
        for saver in savers {
            let _span = trace_span!("save", section = %saver.name, part = %saver.part).entered();
            context.begin_section(&saver.name, saver.priority.into())?;
            (saver.callback)(&mut context).map_err(|e| saver_failed(&saver.name, e))?;
            context.end_section()?;
        }

        let mut async_savers: Vec<_> = self.registrations.async_savers.iter().collect();
        async_savers.sort_by_key(|s| s.priority);
        let mut continuations = Vec::with_capacity(async_savers.len());
        for saver in async_savers {
            let _span =
                trace_span!("capture", section = %saver.name, part = %saver.part).entered();
            let continuation = (saver.callback)().map_err(|e| saver_failed(&saver.name, e))?;
            continuations.push((saver.name.clone(), continuation));
        }

        Ok((context, continuations))
    }

    /// Load state from a snapshot stream.
    ///
    /// Sections are handed to loaders in the order they appear in the stream.
    /// Sections without a loader are skipped.
    pub fn load_snapshot(&self, input: &mut dyn Read) -> Result<()> {
        let version = checkpoint::read_header(input)?;
        if let Some(part) = self
            .parts
            .iter()
            .find(|p| !p.validate_snapshot_version(version))
        {
            return Err(AutomatonError::SnapshotVersionUnsupported {
                version,
                part: part.name().to_string(),
            });
        }

        let mut context = LoadContext::new(version);
        while let Some(section) = checkpoint::read_section(input)? {
            let Some(loader) = self.registrations.loaders.get(&section.name) else {
                warn!(
                    section = %section.name,
                    kind = ?section.kind,
                    size = section.payload.len(),
                    "Skipping snapshot section without a loader"
                );
                continue;
            };

            let name = section.name.clone();
            let _span = trace_span!("load", section = %name, part = %loader.part).entered();
            context.enter_section(section);
            (loader.callback)(&mut context).map_err(|e| AutomatonError::LoaderFailed {
                name: name.clone(),
                cause: e.to_string(),
            })?;
            context.leave_section();
        }

        debug!(
            version,
            entities = context.entity_count(),
            "Loaded composite automaton snapshot"
        );
        Ok(())
    }

    /// Dispatch a mutation to its handler.
    ///
    /// An unknown mutation type is a consistency violation. Handler errors
    /// are reported as [`AutomatonError::HandlerFailed`].
    pub fn apply_mutation(&self, context: &mut MutationContext) -> Result<()> {
        let method = self
            .registrations
            .methods
            .get(context.mutation_type())
            .ok_or_else(|| AutomatonError::UnknownMutationType {
                mutation_type: context.mutation_type().to_string(),
            })?;

        let _span = trace_span!(
            "apply",
            tag = %method.profiling_tag,
            part = %method.part,
            version = %context.version()
        )
        .entered();

        (method.callback)(&mut *context).map_err(|e| AutomatonError::HandlerFailed {
            mutation_type: context.mutation_type().to_string(),
            cause: e.to_string(),
        })
    }
}

fn saver_failed(name: &str, err: AutomatonError) -> AutomatonError {
    AutomatonError::SaverFailed {
        name: name.to_string(),
        cause: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationRequest;
    use crate::serialize::{AsyncSerializationPriority, EntitySerializationKey, SyncSerializationPriority};
    use crate::store::StoreFuture;
    use bytes::Bytes;
    use hydra_core::Version;
    use parking_lot::Mutex;
    use std::io::{Cursor, Write};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct MemoryWriter {
        buf: SharedBuf,
    }

    impl SnapshotWriter for MemoryWriter {
        fn stream(&mut self) -> &mut (dyn Write + Send) {
            &mut self.buf
        }

        fn close(self: Box<Self>) -> StoreFuture<'static, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    /// Part recording the order in which its handlers run.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl AutomatonPart for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn register(self: Arc<Self>, registrar: &mut PartRegistrar<'_>) -> Result<()> {
            let name = self.name;

            let log = Arc::clone(&self.log);
            registrar.register_saver(
                format!("{name}.values"),
                SyncSerializationPriority::Values,
                move |ctx| {
                    log.lock().push(format!("save {name}.values"));
                    ctx.write_str(name)
                },
            )?;

            let log = Arc::clone(&self.log);
            registrar.register_saver(
                format!("{name}.keys"),
                SyncSerializationPriority::Keys,
                move |ctx| {
                    log.lock().push(format!("save {name}.keys"));
                    let key = ctx.generate_key();
                    ctx.write_key(key)
                },
            )?;

            let log = Arc::clone(&self.log);
            registrar.register_async_saver(
                format!("{name}.async"),
                AsyncSerializationPriority::Default,
                move || {
                    log.lock().push(format!("capture {name}.async"));
                    let log = Arc::clone(&log);
                    Ok(Box::new(move |ctx: &mut SaveContext| {
                        log.lock().push(format!("save {name}.async"));
                        ctx.write_u64(42)
                    }) as AsyncSaveContinuation)
                },
            )?;

            for section in ["keys", "values", "async"] {
                let log = Arc::clone(&self.log);
                registrar.register_loader(format!("{name}.{section}"), move |_| {
                    log.lock().push(format!("load {name}.{section}"));
                    Ok(())
                })?;
            }

            let log = Arc::clone(&self.log);
            registrar.register_method(format!("{name}.Touch"), move |ctx| {
                log.lock().push(format!("apply {name} at {}", ctx.version()));
                ctx.set_response(Bytes::from_static(b"ok"));
                Ok(())
            })?;

            registrar.register_method(format!("{name}.Fail"), |_| Err(AutomatonError::part("boom")))
        }

        fn clear(&self) {
            self.log.lock().push(format!("clear {}", self.name));
        }

        fn on_start_leading(&self) {
            self.log.lock().push(format!("start leading {}", self.name));
        }
    }

    fn composite(log: &Arc<Mutex<Vec<String>>>) -> CompositeAutomaton {
        let mut composite = CompositeAutomaton::new();
        for name in ["a", "b"] {
            composite
                .register_part(Arc::new(Recorder {
                    name,
                    log: Arc::clone(log),
                }))
                .unwrap();
        }
        composite
    }

    async fn save(composite: &CompositeAutomaton) -> Vec<u8> {
        let buf = SharedBuf::default();
        let writer = composite
            .save_snapshot(Box::new(MemoryWriter { buf: buf.clone() }))
            .await
            .unwrap();
        writer.close().await.unwrap();
        let data = buf.0.lock().clone();
        data
    }

    #[tokio::test]
    async fn save_orders_sections_and_load_follows_stream() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = composite(&log);

        let data = save(&composite).await;
        assert_eq!(
            *log.lock(),
            vec![
                "save a.keys",
                "save b.keys",
                "save a.values",
                "save b.values",
                "capture a.async",
                "capture b.async",
                "save a.async",
                "save b.async",
            ]
        );

        log.lock().clear();
        composite.load_snapshot(&mut Cursor::new(data)).unwrap();
        assert_eq!(
            *log.lock(),
            vec![
                "load a.keys",
                "load b.keys",
                "load a.values",
                "load b.values",
                "load a.async",
                "load b.async",
            ]
        );
    }

    #[tokio::test]
    async fn failing_saver_fails_the_save() {
        struct Broken;

        impl AutomatonPart for Broken {
            fn name(&self) -> &str {
                "broken"
            }

            fn register(self: Arc<Self>, registrar: &mut PartRegistrar<'_>) -> Result<()> {
                registrar.register_saver("broken.keys", SyncSerializationPriority::Keys, |_| {
                    Err(AutomatonError::part("cannot save"))
                })
            }

            fn clear(&self) {}
        }

        let mut composite = CompositeAutomaton::new();
        composite.register_part(Arc::new(Broken)).unwrap();
        let err = composite
            .save_snapshot(Box::new(MemoryWriter {
                buf: SharedBuf::default(),
            }))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "H602");
    }

    #[test]
    fn duplicate_part_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut composite = composite(&log);
        let err = composite
            .register_part(Arc::new(Recorder {
                name: "a",
                log: Arc::clone(&log),
            }))
            .unwrap_err();
        assert_eq!(err.code(), "H604");
        assert_eq!(composite.parts().len(), 2);
    }

    #[test]
    fn clear_and_hooks_follow_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = composite(&log);
        composite.clear();
        composite.notify(PartEvent::StartLeading);
        assert_eq!(
            *log.lock(),
            vec!["clear a", "clear b", "start leading a", "start leading b"]
        );
    }

    #[test]
    fn apply_dispatches_by_type() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = composite(&log);

        let mut ctx = MutationContext::new(
            Version::new(1, 0),
            MutationRequest::new("b.Touch", Bytes::new()),
            0,
            0,
        );
        composite.apply_mutation(&mut ctx).unwrap();
        assert_eq!(ctx.response().data, Bytes::from_static(b"ok"));
        assert_eq!(*log.lock(), vec!["apply b at 1:0"]);

        let mut ctx = MutationContext::new(
            Version::new(1, 1),
            MutationRequest::new("c.Touch", Bytes::new()),
            0,
            0,
        );
        let err = composite.apply_mutation(&mut ctx).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.code(), "H401");

        let mut ctx = MutationContext::new(
            Version::new(1, 1),
            MutationRequest::new("a.Fail", Bytes::new()),
            0,
            0,
        );
        let err = composite.apply_mutation(&mut ctx).unwrap_err();
        assert!(matches!(err, AutomatonError::HandlerFailed { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn unknown_sections_are_skipped() {
        let mut data = Vec::new();
        checkpoint::write_header(&mut data, SNAPSHOT_FORMAT_VERSION).unwrap();
        checkpoint::write_section(&mut data, "gone.keys", SectionKind::Keys, b"xyz").unwrap();
        checkpoint::write_section(&mut data, "a.keys", SectionKind::Keys, b"").unwrap();
        checkpoint::write_terminator(&mut data).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = composite(&log);
        composite.load_snapshot(&mut Cursor::new(data)).unwrap();
        assert_eq!(*log.lock(), vec!["load a.keys"]);
    }

    #[test]
    fn rejected_format_version() {
        let mut data = Vec::new();
        checkpoint::write_header(&mut data, SNAPSHOT_FORMAT_VERSION + 1).unwrap();
        checkpoint::write_terminator(&mut data).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let err = composite(&log)
            .load_snapshot(&mut Cursor::new(data))
            .unwrap_err();
        assert_eq!(err.code(), "H307");
    }

    #[test]
    fn entity_key_defaults() {
        assert_eq!(EntitySerializationKey::default(), EntitySerializationKey::NONE);
    }
}
