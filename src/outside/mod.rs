mod command;
mod ffmpeg;
mod ytdl;

pub use command::hard_kill;
pub use ffmpeg::{Ffmpeg, StreamMuxer};
pub use ytdl::{DownloadSpec, ExtractorOptions, OutputTarget, StreamExtractor, Ytdl};
