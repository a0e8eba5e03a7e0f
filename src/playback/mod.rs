pub mod audio;
pub mod ffmpeg_media;
pub mod media;
pub mod recovery;

pub use ffmpeg_media::*;
pub use media::*;
pub use recovery::*;
