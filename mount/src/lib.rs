mod supervisor;

pub use supervisor::ReadyHandle;
pub use supervisor::mount;
pub use supervisor::unmount;
