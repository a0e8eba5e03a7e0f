use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;

use crate::core::VideoItem;
use crate::source::{CollectionKey, FetchError, RandomRecordSource, RecordApi};

/// Request for one more item of a collection
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub request_id: u64,
    pub collection: CollectionKey,
}

/// Result of a fetch, delivered back to the GUI thread
#[derive(Debug)]
pub struct FetchResult {
    pub request_id: u64,
    pub collection: CollectionKey,
    pub result: Result<VideoItem, FetchError>,
}

/// Anything that can start fetching the next item of a feed.
/// Completion is reported separately through the feed controller; an error
/// here means the request never went out.
pub trait ItemRequester {
    fn request_item(&mut self) -> Result<(), FetchError>;
}

/// Cloneable sending half of a [`RecordFetcher`]
#[derive(Clone)]
pub struct FetchHandle {
    request_sender: mpsc::UnboundedSender<FetchRequest>,
    next_request_id: Arc<AtomicU64>,
}

impl FetchHandle {
    pub fn request(&self, collection: &CollectionKey) -> Result<u64, FetchError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request = FetchRequest {
            request_id,
            collection: collection.clone(),
        };

        if let Err(e) = self.request_sender.send(request) {
            log::error!("Failed to send fetch request for {}: {}", collection, e);
            return Err(FetchError::WorkerStopped);
        }

        Ok(request_id)
    }

    /// Bind this handle to one collection so a feed can request items from it.
    pub fn for_collection(&self, collection: CollectionKey) -> CollectionRequester {
        CollectionRequester {
            handle: self.clone(),
            collection,
        }
    }
}

pub struct CollectionRequester {
    handle: FetchHandle,
    collection: CollectionKey,
}

impl CollectionRequester {
    pub fn collection(&self) -> &CollectionKey {
        &self.collection
    }
}

impl ItemRequester for CollectionRequester {
    fn request_item(&mut self) -> Result<(), FetchError> {
        let request_id = self.handle.request(&self.collection)?;
        log::debug!("Requested next item of {} (request {})", self.collection, request_id);
        Ok(())
    }
}

/// Runs the record source on a background thread with its own runtime.
/// Requests are served one at a time in arrival order.
pub struct RecordFetcher {
    handle: FetchHandle,
    result_receiver: Mutex<mpsc::UnboundedReceiver<FetchResult>>,
}

impl RecordFetcher {
    pub fn new<A: RecordApi + 'static>(api: A) -> Self {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<FetchRequest>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<FetchResult>();

        thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Failed to create fetcher runtime: {}", e);
                    return;
                }
            };

            let mut source = RandomRecordSource::new(api);

            rt.block_on(async {
                while let Some(request) = request_rx.recv().await {
                    log::debug!("Fetching next item of {} (request {})", request.collection, request.request_id);

                    let result = source.fetch_next(&request.collection).await;
                    match &result {
                        Ok(item) => log::info!("Fetched '{}' ({}) from {}", item.title, item.id, request.collection),
                        Err(e) => log::error!("Error fetching random video from {}: {}", request.collection, e),
                    }

                    let response = FetchResult {
                        request_id: request.request_id,
                        collection: request.collection,
                        result,
                    };

                    if result_tx.send(response).is_err() {
                        log::debug!("Fetch result receiver dropped, stopping fetcher");
                        break;
                    }
                }
            });

            log::info!("Record fetcher exited");
        });

        Self {
            handle: FetchHandle {
                request_sender: request_tx,
                next_request_id: Arc::new(AtomicU64::new(0)),
            },
            result_receiver: Mutex::new(result_rx),
        }
    }

    pub fn handle(&self) -> FetchHandle {
        self.handle.clone()
    }

    /// Completed fetches since the last call (non-blocking)
    pub fn completed(&self) -> Vec<FetchResult> {
        let mut results = Vec::new();

        if let Ok(mut receiver) = self.result_receiver.lock() {
            while let Ok(result) = receiver.try_recv() {
                results.push(result);
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Record, RecordFields};
    use async_trait::async_trait;
    use std::time::{Duration, Instant};

    struct SingleRecordApi;

    #[async_trait]
    impl RecordApi for SingleRecordApi {
        async fn list_ids(&self, _collection: &CollectionKey) -> Result<Vec<String>, FetchError> {
            Ok(vec!["recOnly".to_string()])
        }

        async fn get_record(&self, _table: &str, id: &str) -> Result<Record, FetchError> {
            Ok(Record { id: id.to_string(), fields: RecordFields::default() })
        }
    }

    fn wait_for_results(fetcher: &RecordFetcher, count: usize) -> Vec<FetchResult> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut results = Vec::new();
        while results.len() < count && Instant::now() < deadline {
            results.extend(fetcher.completed());
            std::thread::sleep(Duration::from_millis(10));
        }
        results
    }

    #[test]
    fn test_requests_are_answered_in_order() {
        let fetcher = RecordFetcher::new(SingleRecordApi);
        let key = CollectionKey::new("tbl", "viw");
        let handle = fetcher.handle();

        let first = handle.request(&key).unwrap();
        let second = handle.request(&key).unwrap();
        assert!(second > first);

        let results = wait_for_results(&fetcher, 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].request_id, first);
        assert_eq!(results[1].request_id, second);
        assert_eq!(results[0].result.as_ref().unwrap().id, "recOnly");
        assert_eq!(results[1].collection, key);
    }

    #[test]
    fn test_collection_requester_targets_its_collection() {
        let fetcher = RecordFetcher::new(SingleRecordApi);
        let key = CollectionKey::new("tblSales", "viwSales");
        let mut requester = fetcher.handle().for_collection(key.clone());

        requester.request_item().unwrap();

        let results = wait_for_results(&fetcher, 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].collection, key);
    }
}
