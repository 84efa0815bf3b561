pub mod helpers;
pub mod use_cases;
