mod app_hook;

pub use app_hook::*;
