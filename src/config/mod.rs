mod settings;

pub use settings::{ChainDescriptor, DatabaseSettings, Settings, StorageSettings};
