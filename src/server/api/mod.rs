pub mod health_controller;
pub mod image_controller;
pub mod monitoring_controller;
pub mod proxy_controller;
