pub mod store;

pub use store::{ForecastRow, PantryRepository, PantryStore, PredictorStateRow, ProfileRow};
