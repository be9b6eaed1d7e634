pub mod api_dto;
pub mod error_dto;
pub mod image_dto;
pub mod stats_dto;
pub mod status_dto;
