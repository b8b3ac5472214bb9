mod extension;
mod metadata;
mod stage;

pub use extension::Extension;
pub use metadata::MediaMetadata;
pub use stage::Stage;
