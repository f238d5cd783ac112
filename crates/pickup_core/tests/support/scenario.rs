#![allow(dead_code)]

use std::time::Duration;

use pickup_core::request::{Coordinate, RawRequest};
use pickup_core::test_helpers::{
    lax_origin, neighbor_origin, raw_at, sfo_origin, sfo_raw_at, ScriptedRouter,
};

/// Six flights: three LAX drop-offs from adjacent cells in one slot, two SFO
/// drop-offs an hour apart, and one LAX record with an out-of-range pickup
/// coordinate.
pub fn six_flights() -> Vec<RawRequest> {
    vec![
        raw_at(1, lax_origin(), 0),
        raw_at(2, neighbor_origin(0), 3),
        raw_at(3, neighbor_origin(1), 6),
        sfo_raw_at(4, sfo_origin(), 0),
        sfo_raw_at(5, sfo_origin(), 60),
        raw_at(6, Coordinate::new(123.0, -118.44), 4),
    ]
}

/// A late LAX drop-off next to the trio whose pickup leg is slow, see
/// [`detour_router`].
pub fn detour_flight() -> RawRequest {
    raw_at(7, neighbor_origin(3), 9)
}

/// Router where the leg to [`detour_flight`]'s pickup takes half an hour.
pub fn detour_router() -> ScriptedRouter {
    ScriptedRouter::new().with_leg(
        neighbor_origin(1),
        neighbor_origin(3),
        Duration::from_secs(30 * 60),
    )
}
