//! Schema migrations for the SQLite trip store.
//!
//! Applied in order on every open; `rusqlite_migration` records the reached
//! version in `user_version`, so each step runs once per database.

use rusqlite_migration::{M, Migrations};

/// Initial layout: trips and their GPS points.
const CREATE_TRIPS_AND_POINTS: &str = r#"
CREATE TABLE trips (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    total_distance REAL NOT NULL DEFAULT 0,
    duration INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 0,
    name TEXT
);

CREATE TABLE gps_points (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trip_id INTEGER NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    timestamp INTEGER NOT NULL,
    FOREIGN KEY (trip_id) REFERENCES trips(id) ON DELETE CASCADE
);

CREATE INDEX idx_gps_points_trip ON gps_points(trip_id, id);
CREATE INDEX idx_trips_start_time ON trips(start_time);
"#;

/// Keep fix accuracy so crash recovery can replay the same filter, and let
/// the database refuse a second active trip.
const ADD_ACCURACY_AND_SINGLE_ACTIVE: &str = r#"
ALTER TABLE gps_points ADD COLUMN accuracy REAL;

CREATE UNIQUE INDEX idx_trips_single_active ON trips(is_active) WHERE is_active = 1;
"#;

pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(CREATE_TRIPS_AND_POINTS),
        M::up(ADD_ACCURACY_AND_SINGLE_ACTIVE),
    ])
}
