use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};

use crate::core::VideoItem;
use crate::source::{CollectionKey, FetchError, RecordApi};

/// Sampling-without-replacement state for one collection.
///
/// The universe is loaded once and never refreshed. `seen` is cleared exactly
/// when it covers the whole universe, which starts the next cycle.
#[derive(Debug, Default)]
pub struct SamplingState {
    universe: Option<Vec<String>>,
    seen: HashSet<String>,
}

impl SamplingState {
    pub fn is_loaded(&self) -> bool {
        self.universe.is_some()
    }

    pub fn universe_len(&self) -> usize {
        self.universe.as_ref().map_or(0, |u| u.len())
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// Install the identifier universe. Duplicates collapse, order is kept.
    pub fn set_universe(&mut self, ids: Vec<String>) {
        let mut known = HashSet::with_capacity(ids.len());
        let universe: Vec<String> = ids.into_iter()
            .filter(|id| known.insert(id.clone()))
            .collect();
        self.universe = Some(universe);
        self.seen.clear();
    }

    /// Choose an identifier not yet served in this cycle. Does not mark it;
    /// call [`mark_seen`](Self::mark_seen) once the record was delivered.
    pub fn pick<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<String> {
        let universe = self.universe.as_ref()?;
        if universe.is_empty() {
            return None;
        }

        if self.seen.len() >= universe.len() {
            self.seen.clear();
        }

        let available: Vec<&String> = universe.iter()
            .filter(|id| !self.seen.contains(*id))
            .collect();

        available.choose(rng).map(|id| (*id).clone())
    }

    pub fn mark_seen(&mut self, id: String) {
        self.seen.insert(id);
        if self.seen.len() >= self.universe_len() {
            log::debug!("Sampling cycle complete ({} records), starting over", self.seen.len());
            self.seen.clear();
        }
    }
}

/// Serves random records from any number of collections, each with its own
/// cached universe and seen-set.
pub struct RandomRecordSource<A, R = StdRng> {
    api: A,
    states: HashMap<CollectionKey, SamplingState>,
    rng: R,
}

impl<A: RecordApi> RandomRecordSource<A, StdRng> {
    pub fn new(api: A) -> Self {
        Self::with_rng(api, StdRng::from_entropy())
    }
}

impl<A: RecordApi, R: Rng> RandomRecordSource<A, R> {
    pub fn with_rng(api: A, rng: R) -> Self {
        Self {
            api,
            states: HashMap::new(),
            rng,
        }
    }

    pub fn state(&self, collection: &CollectionKey) -> Option<&SamplingState> {
        self.states.get(collection)
    }

    /// Next random item of the collection. Errors from the API are returned
    /// as-is and leave the seen-set untouched.
    pub async fn fetch_next(&mut self, collection: &CollectionKey) -> Result<VideoItem, FetchError> {
        let state = self.states.entry(collection.clone()).or_default();

        if !state.is_loaded() {
            let ids = self.api.list_ids(collection).await?;
            log::info!("Cached {} record ids for {}", ids.len(), collection);
            state.set_universe(ids);
        }

        let id = state.pick(&mut self.rng)
            .ok_or_else(|| FetchError::EmptyCollection(collection.clone()))?;

        let record = self.api.get_record(&collection.table, &id).await?;
        state.mark_seen(id);

        Ok(VideoItem::from_record(record))
    }
}
