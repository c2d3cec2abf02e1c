use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::composite::ProcessorList;
use super::{AsyncDataProcessor, ProcessorHandle, Processed};
use crate::error::ScopeResult;
use crate::maintenance::{Maintainable, MaintenanceReport};
use crate::scope::ScopeKey;

/// Async version of [`super::CompositeDataProcessor`].
///
/// Stages are awaited one after another, never concurrently: each stage
/// needs the previous stage's output.
pub struct CompositeAsyncDataProcessor<T: ?Sized + Sync, I: ?Sized + Sync, D: Send> {
    list: ProcessorList<dyn AsyncDataProcessor<T, I, D>>,
}

impl<T, I, D> CompositeAsyncDataProcessor<T, I, D>
where
    T: ?Sized + Sync + 'static,
    I: ?Sized + Sync + 'static,
    D: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            list: ProcessorList::new(name),
        }
    }

    pub fn add_processor(
        &self,
        priority: i32,
        processor: Arc<dyn AsyncDataProcessor<T, I, D>>,
    ) -> ProcessorHandle {
        self.list.add(priority, processor)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<T, I, D> AsyncDataProcessor<T, I, D> for CompositeAsyncDataProcessor<T, I, D>
where
    T: ?Sized + Sync + 'static,
    I: ?Sized + Sync + 'static,
    D: Send + 'static,
{
    fn register_scopes(&self, target: &T, key: &ScopeKey) -> ScopeResult<()> {
        let traversal = self.list.traverse();
        for processor in traversal.processors() {
            processor.register_scopes(target, key)?;
        }
        Ok(())
    }

    async fn process_data(
        &self,
        target: &T,
        key: Option<&ScopeKey>,
        id: &I,
        data: D,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Processed<D>> {
        let traversal = self.list.traverse();
        let mut modified = false;
        let mut data = data;
        for processor in traversal.processors() {
            if cancel.is_cancelled() {
                anyhow::bail!("processing cancelled in composite '{}'", self.list.name());
            }
            let stage = processor.process_data(target, key, id, data, cancel).await?;
            modified |= stage.modified;
            data = stage.data;
        }
        Ok(Processed { modified, data })
    }
}

impl<T, I, D> Maintainable for CompositeAsyncDataProcessor<T, I, D>
where
    T: ?Sized + Sync + 'static,
    I: ?Sized + Sync + 'static,
    D: Send + 'static,
{
    fn maintain(&self) -> MaintenanceReport {
        self.list.maintain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records when it starts and finishes so tests can check sequencing.
    struct Step {
        name: &'static str,
        delay: Duration,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AsyncDataProcessor<(), str, Vec<&'static str>> for Step {
        fn register_scopes(&self, _target: &(), _key: &ScopeKey) -> ScopeResult<()> {
            Ok(())
        }

        async fn process_data(
            &self,
            _target: &(),
            _key: Option<&ScopeKey>,
            _id: &str,
            mut data: Vec<&'static str>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<Processed<Vec<&'static str>>> {
            self.log.lock().unwrap().push(format!("start {}", self.name));
            tokio::time::sleep(self.delay).await;
            self.log.lock().unwrap().push(format!("end {}", self.name));
            data.push(self.name);
            Ok(Processed::modified(data))
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_sequence() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite: CompositeAsyncDataProcessor<(), str, Vec<&'static str>> =
            CompositeAsyncDataProcessor::new("async-test");
        composite.add_processor(
            1,
            Arc::new(Step {
                name: "second",
                delay: Duration::from_millis(1),
                log: log.clone(),
            }),
        );
        composite.add_processor(
            0,
            Arc::new(Step {
                name: "first",
                delay: Duration::from_millis(20),
                log: log.clone(),
            }),
        );

        let token = CancellationToken::new();
        let out = composite
            .process_data(&(), None, "id", Vec::new(), &token)
            .await
            .unwrap();

        assert_eq!(out.data, vec!["first", "second"]);
        assert!(out.modified);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start first", "end first", "start second", "end second"]
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let composite: CompositeAsyncDataProcessor<(), str, Vec<&'static str>> =
            CompositeAsyncDataProcessor::new("async-test");
        composite.add_processor(
            0,
            Arc::new(Step {
                name: "only",
                delay: Duration::from_millis(1),
                log: Arc::new(Mutex::new(Vec::new())),
            }),
        );

        let token = CancellationToken::new();
        token.cancel();
        let result = composite
            .process_data(&(), None, "id", Vec::new(), &token)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_removed_stage_is_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite: CompositeAsyncDataProcessor<(), str, Vec<&'static str>> =
            CompositeAsyncDataProcessor::new("async-test");
        let handle = composite.add_processor(
            0,
            Arc::new(Step {
                name: "gone",
                delay: Duration::from_millis(1),
                log: log.clone(),
            }),
        );
        handle.remove();

        let token = CancellationToken::new();
        let out = composite
            .process_data(&(), None, "id", Vec::new(), &token)
            .await
            .unwrap();
        assert!(!out.modified);
        assert!(out.data.is_empty());
        assert!(composite.is_empty());
        assert_eq!(composite.maintain().live, 0);
    }
}
