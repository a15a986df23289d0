mod image_caption;

use crate::HandlerPayload;
pub use image_caption::*;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

/// An inference capability. Implementations own their weights and any mutable
/// decoding state, so they are driven from a single worker thread.
pub trait Model {
    type Item;
    type Output;

    fn process(
        &mut self,
        items: Vec<Self::Item>,
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<anyhow::Result<Self::Output>>>> + Send;

    fn batch_size_limit(&self) -> usize;
}

pub type BatchHandlerTx<Item, Output> = mpsc::Sender<HandlerPayload<Item, Output>>;

/// Cloneable handle to a loaded model running on its own worker thread.
///
/// The worker exits once every handle has been dropped.
#[derive(Debug)]
pub struct AIModel<TItem, TOutput> {
    model_id: String, // for better logging
    tx: BatchHandlerTx<TItem, TOutput>,
}

impl<TItem, TOutput> Clone for AIModel<TItem, TOutput> {
    fn clone(&self) -> Self {
        Self {
            model_id: self.model_id.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<TItem, TOutput> AIModel<TItem, TOutput>
where
    TItem: Send + Sync + Clone + Debug + 'static,
    TOutput: Send + Sync + Debug + 'static,
{
    /// Move an already constructed model onto a dedicated worker thread.
    pub fn spawn<T>(model_id: impl Into<String>, model: T) -> anyhow::Result<Self>
    where
        T: Model<Item = TItem, Output = TOutput> + Send + 'static,
    {
        let model_id = model_id.into();
        let (tx, mut rx) = mpsc::channel::<HandlerPayload<TItem, TOutput>>(512);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let worker_model_id = model_id.clone();
        std::thread::Builder::new()
            .name("model-worker".into())
            .spawn(move || {
                let mut model = model;
                rt.block_on(async move {
                    while let Some((items, result_tx)) = rx.recv().await {
                        // If channel closed,
                        // we have no way to response, just ignore task.
                        if result_tx.is_closed() {
                            tracing::debug!(model_id = %worker_model_id, "caller gone, skip items");
                            continue;
                        }

                        let results = model.process(items).await;
                        if result_tx.send(results).is_err() {
                            tracing::error!(model_id = %worker_model_id, "failed to send results");
                        }
                    }
                    tracing::info!(model_id = %worker_model_id, "all handles dropped, worker exits");
                });
            })?;

        Ok(Self { model_id, tx })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    #[tracing::instrument(name = "AIModel::process", err(Debug), skip_all, fields(model_id=%self.model_id))]
    pub async fn process(&self, items: Vec<TItem>) -> anyhow::Result<Vec<anyhow::Result<TOutput>>> {
        let (result_tx, rx) = oneshot::channel();
        if let Err(e) = self.tx.send((items, result_tx)).await {
            anyhow::bail!("failed to send items: {:?}", e);
        }
        tracing::debug!("items sent to model");

        match rx.await {
            Ok(result) => result,
            Err(e) => {
                anyhow::bail!("failed to receive results: {:?}", e);
            }
        }
    }

    #[tracing::instrument(name = "AIModel::process_single", err(Debug), skip_all, fields(model_id=%self.model_id))]
    pub async fn process_single(&self, item: TItem) -> anyhow::Result<TOutput> {
        let results = self.process(vec![item]).await?;
        let result = results
            .into_iter()
            .next()
            .ok_or(anyhow::anyhow!("no result"))??;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    impl Model for Doubler {
        type Item = u32;
        type Output = u32;

        fn batch_size_limit(&self) -> usize {
            4
        }

        async fn process(
            &mut self,
            items: Vec<Self::Item>,
        ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
            if items.len() > self.batch_size_limit() {
                anyhow::bail!("too many items");
            }
            Ok(items
                .into_iter()
                .map(|v| {
                    if v == 0 {
                        Err(anyhow::anyhow!("zero is rejected"))
                    } else {
                        Ok(v * 2)
                    }
                })
                .collect())
        }
    }

    #[test_log::test(tokio::test)]
    async fn worker_processes_items_in_order() {
        let model = AIModel::spawn("doubler", Doubler).expect("spawn worker");
        let results = model.process(vec![1, 0, 3]).await.expect("batch accepted");

        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().expect("first"), 2);
        assert!(results[1].is_err());
        assert_eq!(*results[2].as_ref().expect("third"), 6);
        assert_eq!(model.model_id(), "doubler");
    }

    #[test_log::test(tokio::test)]
    async fn process_single_surfaces_item_error() {
        let model = AIModel::spawn("doubler", Doubler).expect("spawn worker");

        assert_eq!(model.process_single(21).await.expect("doubled"), 42);
        assert!(model.process_single(0).await.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn oversize_batch_is_rejected_by_model() {
        let model = AIModel::spawn("doubler", Doubler).expect("spawn worker");
        assert!(model.process(vec![1; 5]).await.is_err());

        // clones talk to the same worker
        let other = model.clone();
        assert_eq!(other.process_single(5).await.expect("doubled"), 10);
    }
}
