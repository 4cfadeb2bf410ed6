pub mod clean;
pub mod install;
pub mod verify;
