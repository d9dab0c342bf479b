pub mod active_view;
pub mod series_store;
