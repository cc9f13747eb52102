//! Configuration types and re-exports

pub use super::{
    AppConfig, EnsembleSection, ExportConfig, FeaturesConfig, LoggingConfig, MarketConfig,
    PersistenceConfig, ResidualSection, SequenceSection, TrainingSection, TrendSection,
};
