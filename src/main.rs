mod core;
mod feed;
mod gui;
mod playback;
mod source;

use eframe::egui;
use gui::FeedApp;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([480.0, 860.0])
            .with_min_inner_size([320.0, 480.0])
            .with_title("Swipe Feed"),
        ..Default::default()
    };

    eframe::run_native(
        "Swipe Feed",
        options,
        Box::new(|cc| {
            match FeedApp::new(cc) {
                Ok(app) => Ok(Box::new(app)),
                Err(e) => {
                    eprintln!("Failed to initialize app: {}", e);
                    std::process::exit(1);
                }
            }
        }),
    ).map_err(|e| anyhow::anyhow!("Failed to run app: {}", e))?;

    Ok(())
}
