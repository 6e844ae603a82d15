pub mod composite;
pub mod config;
pub mod events;
pub mod folder;
pub mod separators;
pub mod service;
pub mod session;
pub mod slices;
pub mod viewport;

#[cfg(test)]
mod test_support;

pub use composite::{CompositeDescription, InvalidSpecError, SliceSpec};
pub use config::{default_config_path, load_splitter_config, save_splitter_config, SplitterConfig};
pub use events::{channel, EventReceiver, EventSender, LoadProgress, SessionEvent};
pub use folder::FolderImageService;
pub use separators::{Band, Separator, SeparatorError, SeparatorId, SeparatorRow, SeparatorSet};
pub use service::{ExportReport, ImageService, ServiceError};
pub use session::{
    CursorStyle, Effect, InputEvent, SessionController, SessionError, SessionPhase,
};
pub use slices::{LoadState, PixelHandle, Slice, SliceRegistry};
pub use viewport::{ScrollBehavior, ScrollRequest, ViewportCoordinator, ViewportState};
