pub mod commands;
pub mod menu;
