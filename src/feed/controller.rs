use egui::Key;

use crate::core::VideoItem;
use crate::feed::{direction_for_key, Direction};
use crate::source::{FetchError, ItemRequester};

#[derive(Debug, Clone, Default)]
pub struct FeedState {
    pub items: Vec<VideoItem>,
    pub current_index: usize,
    /// Set once by the explicit start action, never cleared
    pub has_interacted: bool,
    /// True only while a fetch is in flight
    pub is_loading: bool,
    pub error: Option<String>,
}

impl FeedState {
    pub fn current_item(&self) -> Option<&VideoItem> {
        self.items.get(self.current_index)
    }

    pub fn is_at_end(&self) -> bool {
        self.items.is_empty() || self.current_index + 1 >= self.items.len()
    }
}

/// Owns the loaded items and the current position of one feed.
///
/// Fetches go out through the [`ItemRequester`]; their outcome comes back via
/// [`on_fetch_result`](Self::on_fetch_result). At most one fetch is
/// outstanding at any time.
pub struct FeedController<R: ItemRequester> {
    state: FeedState,
    requester: R,
    initialized: bool,
    /// Forward navigation that is waiting for the in-flight item
    pending_advance: bool,
}

impl<R: ItemRequester> FeedController<R> {
    pub fn new(requester: R) -> Self {
        Self {
            state: FeedState::default(),
            requester,
            initialized: false,
            pending_advance: false,
        }
    }

    pub fn state(&self) -> &FeedState {
        &self.state
    }

    pub fn current_item(&self) -> Option<&VideoItem> {
        self.state.current_item()
    }

    pub fn requester(&self) -> &R {
        &self.requester
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Fetch the first item. Only the first call has any effect.
    pub fn init(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        log::info!("Initializing feed");
        self.request_fetch();
    }

    /// Explicit start action; unlocks playback for the rest of the session.
    pub fn start(&mut self) {
        if !self.state.has_interacted {
            log::info!("User started the feed");
            self.state.has_interacted = true;
        }
    }

    /// Move through the feed. Returns true if the current index changed.
    pub fn advance(&mut self, direction: Direction) -> bool {
        let moved = match direction {
            Direction::Backward => {
                self.pending_advance = false;
                if self.state.current_index > 0 {
                    self.state.current_index -= 1;
                    true
                } else {
                    false
                }
            }
            Direction::Forward => {
                if !self.state.is_at_end() {
                    self.state.current_index += 1;
                    true
                } else {
                    // At the end: advance once the next item has been appended.
                    self.request_fetch();
                    if !self.state.items.is_empty() && self.state.is_loading {
                        self.pending_advance = true;
                    }
                    false
                }
            }
        };

        if moved {
            log::debug!("Feed moved {:?} to index {}", direction, self.state.current_index);
            self.prefetch_if_at_end();
        }
        moved
    }

    /// The active item finished playing without looping.
    pub fn on_item_end(&mut self) -> bool {
        log::debug!("Item {} ended", self.state.current_index);
        self.advance(Direction::Forward)
    }

    pub fn handle_swipe(&mut self, direction: Option<Direction>) -> bool {
        match direction {
            Some(direction) => self.advance(direction),
            None => false,
        }
    }

    pub fn handle_key(&mut self, key: Key) -> bool {
        match direction_for_key(key, self.state.current_index) {
            Some(direction) => self.advance(direction),
            None => false,
        }
    }

    /// Outcome of the fetch started by this feed. A successful item is
    /// always appended, even if the user has navigated away from the end.
    pub fn on_fetch_result(&mut self, result: Result<VideoItem, FetchError>) {
        self.state.is_loading = false;

        match result {
            Ok(item) => {
                log::info!("Appending '{}' to feed at position {}", item.title, self.state.items.len());
                self.state.error = None;
                self.state.items.push(item);

                if self.pending_advance {
                    self.pending_advance = false;
                    if !self.state.is_at_end() {
                        self.state.current_index += 1;
                    }
                }
                self.prefetch_if_at_end();
            }
            Err(e) => {
                log::error!("Error fetching video: {}", e);
                self.pending_advance = false;
                self.state.error = Some(format!("Failed to load videos: {}", e));
            }
        }
    }

    /// Request again after a failed fetch without moving.
    pub fn retry_fetch(&mut self) -> bool {
        self.state.error = None;
        self.request_fetch()
    }

    fn prefetch_if_at_end(&mut self) {
        if !self.state.items.is_empty() && self.state.is_at_end() {
            self.request_fetch();
        }
    }

    fn request_fetch(&mut self) -> bool {
        if self.state.is_loading {
            log::debug!("Fetch already in flight, not requesting another");
            return false;
        }
        self.state.is_loading = true;
        match self.requester.request_item() {
            Ok(()) => true,
            Err(e) => {
                log::error!("Could not request a video: {}", e);
                self.state.is_loading = false;
                self.pending_advance = false;
                self.state.error = Some(format!("Failed to load videos: {}", e));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingRequester {
        requests: usize,
    }

    impl ItemRequester for CountingRequester {
        fn request_item(&mut self) -> Result<(), FetchError> {
            self.requests += 1;
            Ok(())
        }
    }

    /// Requester whose worker has gone away
    #[derive(Default)]
    struct StoppedRequester {
        attempts: usize,
    }

    impl ItemRequester for StoppedRequester {
        fn request_item(&mut self) -> Result<(), FetchError> {
            self.attempts += 1;
            Err(FetchError::WorkerStopped)
        }
    }

    fn item(id: &str) -> VideoItem {
        VideoItem {
            id: id.to_string(),
            title: format!("Video {}", id),
            description: String::new(),
            video_url: format!("https://cdn.example.com/{}.mp4", id),
            thumbnail_url: String::new(),
        }
    }

    fn controller() -> FeedController<CountingRequester> {
        FeedController::new(CountingRequester::default())
    }

    /// Controller holding the given items with no fetch in flight.
    fn loaded(ids: &[&str]) -> FeedController<CountingRequester> {
        let mut feed = controller();
        feed.init();
        for id in ids {
            feed.on_fetch_result(Ok(item(id)));
        }
        // Appending at the end prefetches; settle that fetch with an error-free no-op.
        feed.state.is_loading = false;
        feed.requester.requests = 0;
        feed
    }

    #[test]
    fn test_init_fetches_once() {
        let mut feed = controller();
        feed.init();
        feed.init();

        assert_eq!(feed.requester().requests, 1);
        assert!(feed.state().is_loading);
        assert!(!feed.state().has_interacted);
        assert!(feed.current_item().is_none());
    }

    #[test]
    fn test_first_item_triggers_prefetch() {
        let mut feed = controller();
        feed.init();
        feed.on_fetch_result(Ok(item("A")));

        assert_eq!(feed.state().current_index, 0);
        assert_eq!(feed.current_item().unwrap().id, "A");
        // Viewing the last item prefetches the next one.
        assert_eq!(feed.requester().requests, 2);
        assert!(feed.state().is_loading);
    }

    #[test]
    fn test_backward_at_start_is_noop() {
        let mut feed = loaded(&["A", "B"]);

        assert!(!feed.advance(Direction::Backward));
        assert_eq!(feed.state().current_index, 0);
        assert_eq!(feed.requester().requests, 0);
    }

    #[test]
    fn test_forward_with_next_item() {
        let mut feed = loaded(&["A", "B", "C"]);

        assert!(feed.advance(Direction::Forward));
        assert_eq!(feed.state().current_index, 1);
        assert_eq!(feed.requester().requests, 0);

        assert!(feed.advance(Direction::Forward));
        assert_eq!(feed.state().current_index, 2);
        // Reached the last item: prefetch
        assert_eq!(feed.requester().requests, 1);

        assert!(feed.advance(Direction::Backward));
        assert_eq!(feed.state().current_index, 1);
    }

    #[test]
    fn test_item_end_at_last_fetches_once_and_advances_on_arrival() {
        let mut feed = loaded(&["A"]);

        assert!(!feed.on_item_end());
        assert_eq!(feed.requester().requests, 1);
        assert_eq!(feed.state().current_index, 0);

        // Repeated end signals while the fetch is in flight do not duplicate it.
        feed.on_item_end();
        assert_eq!(feed.requester().requests, 1);

        feed.on_fetch_result(Ok(item("B")));
        assert_eq!(feed.state().current_index, 1);
        assert_eq!(feed.current_item().unwrap().id, "B");
        // Now at the end again: the next prefetch goes out.
        assert_eq!(feed.requester().requests, 2);
    }

    #[test]
    fn test_item_end_in_middle_just_advances() {
        let mut feed = loaded(&["A", "B", "C"]);

        assert!(feed.on_item_end());
        assert_eq!(feed.state().current_index, 1);
        assert_eq!(feed.requester().requests, 0);
    }

    #[test]
    fn test_forward_at_end_waits_for_prefetch() {
        let mut feed = controller();
        feed.init();
        feed.on_fetch_result(Ok(item("A")));
        assert_eq!(feed.requester().requests, 2); // init + prefetch

        // The prefetch is already in flight; swiping forward reuses it.
        assert!(!feed.advance(Direction::Forward));
        assert_eq!(feed.requester().requests, 2);

        feed.on_fetch_result(Ok(item("B")));
        assert_eq!(feed.state().current_index, 1);
    }

    #[test]
    fn test_stale_result_is_appended_without_moving() {
        let mut feed = loaded(&["A", "B"]);
        feed.advance(Direction::Forward);
        assert_eq!(feed.requester().requests, 1);

        // Ask for the next item, then go back before it arrives.
        feed.advance(Direction::Forward);
        feed.advance(Direction::Backward);
        assert_eq!(feed.state().current_index, 0);

        feed.on_fetch_result(Ok(item("C")));
        assert_eq!(feed.state().items.len(), 3);
        assert_eq!(feed.state().current_index, 0);
        assert!(!feed.state().is_loading);
    }

    #[test]
    fn test_fetch_error_is_surfaced_and_retried() {
        let mut feed = controller();
        feed.init();
        feed.on_fetch_result(Err(FetchError::Request("offline".into())));

        assert!(!feed.state().is_loading);
        assert!(feed.state().error.as_deref().unwrap().contains("offline"));
        assert!(feed.current_item().is_none());

        // Next forward attempt retries the fetch.
        feed.advance(Direction::Forward);
        assert_eq!(feed.requester().requests, 2);
        feed.on_fetch_result(Ok(item("A")));
        assert!(feed.state().error.is_none());
        assert_eq!(feed.state().current_index, 0);
    }

    #[test]
    fn test_failed_fetch_cancels_pending_advance() {
        let mut feed = loaded(&["A"]);
        feed.advance(Direction::Forward);
        feed.on_fetch_result(Err(FetchError::Status { status: 429, message: "rate limited".into() }));

        assert_eq!(feed.state().current_index, 0);
        feed.advance(Direction::Forward);
        assert_eq!(feed.requester().requests, 2);
        feed.on_fetch_result(Ok(item("B")));
        assert_eq!(feed.state().current_index, 1);
    }

    #[test]
    fn test_unsent_request_does_not_leave_feed_loading() {
        let mut feed = FeedController::new(StoppedRequester::default());
        feed.init();

        assert!(!feed.state().is_loading);
        assert!(feed.state().error.as_deref().unwrap().contains("not running"));

        // Every later attempt is tried again rather than suppressed.
        assert!(!feed.advance(Direction::Forward));
        assert!(!feed.retry_fetch());
        assert_eq!(feed.requester().attempts, 3);
        assert!(!feed.state().is_loading);
        assert!(feed.state().error.is_some());
    }

    #[test]
    fn test_retry_after_failed_prefetch_keeps_position() {
        let mut feed = loaded(&["A", "B"]);
        feed.advance(Direction::Forward);
        feed.on_fetch_result(Err(FetchError::Request("offline".into())));
        feed.advance(Direction::Backward);
        assert_eq!(feed.state().current_index, 0);

        assert!(feed.retry_fetch());
        assert_eq!(feed.state().current_index, 0);
        assert!(feed.state().error.is_none());
        assert_eq!(feed.requester().requests, 2);

        feed.on_fetch_result(Ok(item("C")));
        assert_eq!(feed.state().current_index, 0);
        assert_eq!(feed.state().items.len(), 3);
    }

    #[test]
    fn test_keys_and_swipes() {
        let mut feed = loaded(&["A", "B", "C"]);

        assert!(!feed.handle_key(Key::ArrowLeft));
        assert!(feed.handle_key(Key::ArrowRight));
        assert!(feed.handle_swipe(Some(Direction::Forward)));
        assert!(feed.handle_swipe(Some(Direction::Backward)));
        assert!(!feed.handle_swipe(None));
        assert_eq!(feed.state().current_index, 1);
    }

    #[test]
    fn test_interaction_gate_is_one_way() {
        let mut feed = controller();
        assert!(!feed.state().has_interacted);
        feed.start();
        feed.start();
        assert!(feed.state().has_interacted);
    }

    #[test]
    fn test_index_invariant_holds() {
        let mut feed = loaded(&["A", "B"]);
        let moves = [
            Direction::Forward, Direction::Forward, Direction::Forward,
            Direction::Backward, Direction::Backward, Direction::Backward,
            Direction::Forward,
        ];
        for direction in moves {
            feed.advance(direction);
            assert!(feed.state().current_index < feed.state().items.len());
        }
    }
}
