//! Sea-ORM entity models for the relational datastore.
//!
//! Event logs (`page_visits`, `clearance_generations`,
//! `flight_plans_received`) are append-only. `user_sessions` holds one
//! aggregate row per tracking session, `admin_settings` a single row with the
//! serialized settings tree, and `login_sessions` the persisted
//! `tower-sessions` records for authenticated users. `analytics_resets`
//! records when an admin last zeroed the counters.

pub mod admin_settings;
pub mod analytics_reset;
pub mod clearance_generation;
pub mod discord_user;
pub mod flight_plan_received;
/// Login session records backing [`crate::login_store::DatabaseLoginStore`].
pub mod login_session;
pub mod page_visit;
pub mod user_session;
