pub mod monitor_routes;
pub mod stage_routes;
