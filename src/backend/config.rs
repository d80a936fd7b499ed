use once_cell::sync::Lazy;
use std::env;

pub static API_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("REHOMING_API_ROOT")
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "http://localhost:8000/api".to_string())
});

pub const REQUESTS_PATH: &str = "/rehoming/requests/";
pub const LISTINGS_PATH: &str = "/rehoming/listings/";
pub const PETS_PATH: &str = "/user/pets/";
pub const PROFILE_PATH: &str = "/user/profile/";
