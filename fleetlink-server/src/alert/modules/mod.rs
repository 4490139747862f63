pub mod custom_rule;
pub mod geofence;
pub mod idle;
pub mod maintenance;
pub mod offline;
pub mod speed;
pub mod towing;
