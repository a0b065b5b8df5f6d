// Library for tests and the surrounding console to access modules

pub mod config;
pub mod console;
pub mod cooldown;
pub mod engine;
pub mod inventory;
pub mod models;
pub mod reconcile;
pub mod remote;
pub mod uptime;
