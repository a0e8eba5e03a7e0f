use eframe::egui;
use std::time::{Duration, Instant};

use crate::core::{AppConfig, VideoItem};
use crate::feed::{FeedController, GestureState};
use crate::gui::PosterCache;
use crate::playback::{FfmpegMedia, MediaElement, MediaSettings, PlaybackController, PlaybackPhase, PlaybackSignal};
use crate::source::{AirtableClient, CollectionRequester, RecordFetcher};

/// One selectable feed and its own position/sampling
pub struct FeedSession {
    pub name: String,
    pub controller: FeedController<CollectionRequester>,
}

/// The only item with a live media element
pub struct ActivePlayer<M: MediaElement = FfmpegMedia> {
    pub feed: usize,
    pub index: usize,
    pub controller: PlaybackController<M>,
}

impl<M: MediaElement> ActivePlayer<M> {
    /// Drive playback for this frame and hand a natural end to the feed
    /// that owns the item. Returns true if the feed was told.
    pub fn update(&mut self, feeds: &mut [FeedSession], now: Instant) -> bool {
        match self.controller.update(now) {
            Some(PlaybackSignal::Ended) => match feeds.get_mut(self.feed) {
                Some(session) => {
                    session.controller.on_item_end();
                    true
                }
                None => false,
            },
            None => false,
        }
    }
}

pub struct FeedApp {
    pub config: AppConfig,
    pub feeds: Vec<FeedSession>,
    pub selected_feed: usize,
    pub fetcher: RecordFetcher,
    pub player: Option<ActivePlayer>,
    pub posters: Option<PosterCache>,
    pub gesture: GestureState,
    pub media_settings: MediaSettings,
}

impl FeedApp {
    pub fn new(cc: &eframe::CreationContext<'_>) -> anyhow::Result<Self> {
        let mut visuals = egui::Visuals::dark();
        visuals.override_text_color = Some(egui::Color32::WHITE);
        cc.egui_ctx.set_visuals(visuals);

        let config = AppConfig::load()?;
        if let Some(feed) = config.selected_feed_config() {
            log::info!("Opening feed '{}' ({})", feed.name, feed.collection());
        }
        let client = AirtableClient::from_config(&config)?;
        let fetcher = RecordFetcher::new(client);

        let posters = match PosterCache::new(
            config.playback.poster_cache_size,
            Duration::from_secs(config.request_timeout_secs),
        ) {
            Ok(cache) => Some(cache),
            Err(e) => {
                log::warn!("Posters disabled: {}", e);
                None
            }
        };

        let mut app = Self::with_fetcher(config, fetcher);
        app.posters = posters;
        if let Some(session) = app.feeds.get_mut(app.selected_feed) {
            session.controller.init();
        }
        Ok(app)
    }

    /// Build the feeds without touching the UI; nothing is fetched yet.
    pub fn with_fetcher(config: AppConfig, fetcher: RecordFetcher) -> Self {
        let handle = fetcher.handle();
        let feeds: Vec<FeedSession> = config
            .feeds
            .iter()
            .map(|feed| FeedSession {
                name: feed.name.clone(),
                controller: FeedController::new(handle.for_collection(feed.collection())),
            })
            .collect();

        let selected_feed = config.selected_feed.min(feeds.len().saturating_sub(1));
        let media_settings = MediaSettings::from_config(&config.playback);

        Self {
            config,
            feeds,
            selected_feed,
            fetcher,
            player: None,
            posters: None,
            gesture: GestureState::default(),
            media_settings,
        }
    }

    pub fn selected_session(&self) -> Option<&FeedSession> {
        self.feeds.get(self.selected_feed)
    }

    fn selected_session_mut(&mut self) -> Option<&mut FeedSession> {
        self.feeds.get_mut(self.selected_feed)
    }

    /// Whether the start action has happened in any feed
    pub fn is_started(&self) -> bool {
        self.feeds.iter().any(|f| f.controller.state().has_interacted)
    }

    /// The start action unlocks sound for every feed.
    pub fn start(&mut self) {
        for session in &mut self.feeds {
            session.controller.start();
        }
        if let Some(player) = self.player.as_mut() {
            player.controller.set_user_interacted(true);
        }
    }

    /// Switch feeds. The other feeds keep their items and position.
    pub fn select_feed(&mut self, index: usize) {
        if index >= self.feeds.len() || index == self.selected_feed {
            return;
        }

        let started = self.is_started();
        self.selected_feed = index;
        self.config.selected_feed = index;

        let session = &mut self.feeds[index];
        log::info!("Switched to feed '{}'", session.name);
        if started {
            session.controller.start();
        }
        session.controller.init();
    }

    /// Hand finished fetches to the feed that asked for them.
    pub fn process_fetch_results(&mut self) {
        for completed in self.fetcher.completed() {
            match self
                .feeds
                .iter_mut()
                .find(|f| f.controller.requester().collection() == &completed.collection)
            {
                Some(session) => {
                    log::debug!("Fetch {} finished for feed '{}'", completed.request_id, session.name);
                    session.controller.on_fetch_result(completed.result);
                }
                None => log::warn!(
                    "Dropping fetch {} for unknown collection {}",
                    completed.request_id,
                    completed.collection
                ),
            }
        }
    }

    /// The item the player should be showing, once the feed has been started
    pub fn playback_target(&self) -> Option<(usize, usize, VideoItem)> {
        let session = self.selected_session()?;
        let state = session.controller.state();
        if !state.has_interacted {
            return None;
        }
        state
            .current_item()
            .map(|item| (self.selected_feed, state.current_index, item.clone()))
    }

    /// Keep exactly one active media element, bound to the current item.
    fn sync_player(&mut self) {
        let target = self.playback_target();

        let unchanged = match (&self.player, &target) {
            (Some(player), Some((feed, index, item))) => {
                player.feed == *feed && player.index == *index && player.controller.item().id == item.id
            }
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }

        if let Some(mut old) = self.player.take() {
            old.controller.set_active(false);
        }

        if let Some((feed, index, item)) = target {
            log::info!("Playing item {} of feed {}: '{}'", index, feed, item.title);
            let media = FfmpegMedia::new(self.media_settings.clone());
            let mut controller = PlaybackController::new(media, item, true);
            controller.set_active(true);
            self.player = Some(ActivePlayer { feed, index, controller });
        }
    }

    fn update_player(&mut self) {
        let Some(player) = self.player.as_mut() else {
            return;
        };

        player.update(&mut self.feeds, Instant::now());
    }

    fn handle_keyboard(&mut self, ctx: &egui::Context) {
        let pressed: Vec<egui::Key> = ctx.input(|i| {
            [egui::Key::ArrowLeft, egui::Key::ArrowRight]
                .into_iter()
                .filter(|key| i.key_pressed(*key))
                .collect()
        });

        if let Some(session) = self.selected_session_mut() {
            for key in pressed {
                session.controller.handle_key(key);
            }
        }
    }

    fn handle_gestures(&mut self, response: &egui::Response) {
        if response.drag_started() {
            if let Some(pos) = response.interact_pointer_pos() {
                self.gesture.begin(pos);
            }
        }
        if response.dragged() {
            if let Some(pos) = response.interact_pointer_pos() {
                self.gesture.update(pos);
            }
        }
        if response.drag_stopped() {
            let direction = self.gesture.finish();
            if let Some(session) = self.selected_session_mut() {
                session.controller.handle_swipe(direction);
            }
        }
    }

    fn save_config(&self) {
        if let Err(e) = self.config.save() {
            log::error!("Failed to save config: {}", e);
        }
    }
}

impl eframe::App for FeedApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.process_fetch_results();
        self.handle_keyboard(ctx);
        self.sync_player();
        self.update_player();

        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            self.show_top_bar(ui);
        });

        egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(egui::Color32::BLACK))
            .show(ctx, |ui| {
                self.show_feed(ui);
            });

        ctx.request_repaint();
    }
}

impl FeedApp {
    fn show_top_bar(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            let mut selected = self.selected_feed;
            let current_name = self.selected_session().map(|s| s.name.clone()).unwrap_or_default();

            egui::ComboBox::from_id_source("feed_selector")
                .selected_text(current_name)
                .show_ui(ui, |ui| {
                    for (index, session) in self.feeds.iter().enumerate() {
                        ui.selectable_value(&mut selected, index, &session.name);
                    }
                });

            if selected != self.selected_feed {
                self.select_feed(selected);
                self.save_config();
            }

            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                if let Some(session) = self.selected_session() {
                    let state = session.controller.state();
                    if !state.items.is_empty() {
                        ui.label(format!("{} / {}", state.current_index + 1, state.items.len()));
                    }
                    if state.is_loading {
                        ui.spinner();
                    }
                }
            });
        });
    }

    fn show_feed(&mut self, ui: &mut egui::Ui) {
        let rect = ui.available_rect_before_wrap();
        let response = ui.allocate_rect(rect, egui::Sense::click_and_drag());
        self.handle_gestures(&response);

        let Some(session) = self.selected_session() else {
            ui.put(rect, egui::Label::new("No feeds configured"));
            return;
        };
        let state = session.controller.state();
        let has_interacted = state.has_interacted;
        let feed_loading = state.is_loading;
        let feed_error = state.error.clone();
        let current = state.current_item().cloned();

        // Video frame, or the poster until the first frame is decoded
        let ctx = ui.ctx().clone();
        let frame_texture = self.player.as_mut().and_then(|p| p.controller.media_mut().frame_texture(&ctx));
        let poster_texture = match (&current, self.posters.as_mut()) {
            (Some(item), Some(posters)) => posters.get(&ctx, &item.thumbnail_url),
            _ => None,
        };

        if let Some(texture) = frame_texture.as_ref().or(poster_texture.as_ref()) {
            let tint = if frame_texture.is_some() {
                egui::Color32::WHITE
            } else {
                egui::Color32::from_gray(120)
            };
            ui.painter().image(
                texture.id(),
                fit_rect(rect, texture.size_vec2()),
                egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0)),
                tint,
            );
        }

        if !has_interacted {
            if current.is_some() {
                let button = egui::Button::new(egui::RichText::new("▶  Tap to start with sound").size(22.0))
                    .min_size(egui::vec2(260.0, 64.0));
                if ui.put(centered(rect, egui::vec2(260.0, 64.0)), button).clicked() {
                    self.start();
                }
            } else if feed_error.is_none() {
                ui.put(centered(rect, egui::vec2(48.0, 48.0)), egui::Spinner::new().size(48.0));
            }
        } else if let Some(player) = self.player.as_mut() {
            if response.clicked() {
                player.controller.toggle_playback();
            }
            show_playback_overlay(ui, rect, player);
        } else if current.is_none() && feed_loading {
            ui.put(centered(rect, egui::vec2(48.0, 48.0)), egui::Spinner::new().size(48.0));
        }

        if let Some(item) = &current {
            show_caption(ui, rect, item);
        }

        if let Some(error) = feed_error {
            let error_rect = centered(rect, egui::vec2(rect.width().min(420.0), 96.0))
                .translate(egui::vec2(0.0, rect.height() * 0.25));
            ui.allocate_ui_at_rect(error_rect, |ui| {
                ui.vertical_centered(|ui| {
                    ui.colored_label(egui::Color32::from_rgb(255, 100, 100), &error);
                    if ui.button("Try again").clicked() {
                        if let Some(session) = self.selected_session_mut() {
                            session.controller.retry_fetch();
                        }
                    }
                });
            });
        }
    }
}

fn show_playback_overlay(ui: &mut egui::Ui, rect: egui::Rect, player: &mut ActivePlayer) {
    let state = player.controller.state().clone();

    if let Some(error) = &state.error {
        let error_rect = centered(rect, egui::vec2(rect.width().min(420.0), 80.0));
        ui.put(
            error_rect,
            egui::Label::new(egui::RichText::new(error).color(egui::Color32::from_rgb(255, 100, 100)).size(16.0)).wrap(),
        );
    } else if state.is_loading || state.is_stalled {
        ui.put(centered(rect, egui::vec2(48.0, 48.0)), egui::Spinner::new().size(48.0));
    } else if state.phase == PlaybackPhase::Ready && player.controller.media().is_paused() {
        ui.put(
            centered(rect, egui::vec2(64.0, 64.0)),
            egui::Label::new(egui::RichText::new("▶").size(48.0)),
        );
    }

    let loop_text = if state.is_looping { "🔁 Loop on" } else { "🔁 Loop off" };
    let loop_rect = egui::Rect::from_min_size(rect.right_top() + egui::vec2(-112.0, 12.0), egui::vec2(100.0, 28.0));
    if ui.put(loop_rect, egui::Button::new(loop_text).selected(state.is_looping)).clicked() {
        player.controller.toggle_loop();
    }
}

fn show_caption(ui: &mut egui::Ui, rect: egui::Rect, item: &VideoItem) {
    let caption_rect = egui::Rect::from_min_max(
        egui::pos2(rect.left() + 16.0, rect.bottom() - 110.0),
        egui::pos2(rect.right() - 16.0, rect.bottom() - 12.0),
    );
    ui.painter().rect_filled(caption_rect.expand(6.0), 6.0, egui::Color32::from_black_alpha(140));

    ui.allocate_ui_at_rect(caption_rect, |ui| {
        ui.vertical(|ui| {
            if !item.title.is_empty() {
                ui.label(egui::RichText::new(&item.title).strong().size(18.0));
            }
            if !item.description.is_empty() {
                ui.add(egui::Label::new(&item.description).wrap());
            }
        });
    });
}

fn centered(container: egui::Rect, size: egui::Vec2) -> egui::Rect {
    egui::Rect::from_center_size(container.center(), size)
}

/// Largest rect with the content's aspect ratio that fits inside `container`
pub fn fit_rect(container: egui::Rect, content: egui::Vec2) -> egui::Rect {
    if content.x <= 0.0 || content.y <= 0.0 {
        return container;
    }
    let scale = (container.width() / content.x).min(container.height() / content.y);
    egui::Rect::from_center_size(container.center(), content * scale)
}
