//! Turning fetched store records into validated requests.

use tracing::debug;

use crate::config::ConstraintConfig;
use crate::error::{ServiceError, ValidationError};
use crate::request::{Coordinate, FlightId, RawRequest, Request, ValidationReport};
use crate::services::LookupGateway;

/// Requests admitted to a run and the records excluded from it.
#[derive(Debug, Clone, Default)]
pub struct Admission {
    pub admitted: Vec<Request>,
    pub rejected: Vec<ValidationReport>,
}

enum Side {
    Origin,
    Destination,
}

impl Side {
    fn field(&self) -> &'static str {
        match self {
            Side::Origin => "origin",
            Side::Destination => "destination",
        }
    }

    /// Address to geocode when the record has no coordinate for this side.
    /// The airport side falls back to the airport (and terminal) itself.
    fn address(&self, raw: &RawRequest) -> Option<String> {
        let (address, airport_side) = match self {
            Side::Origin => (raw.origin_address.as_deref(), raw.to_airport == Some(false)),
            Side::Destination => (raw.destination_address.as_deref(), raw.to_airport == Some(true)),
        };
        match address.map(str::trim).filter(|a| !a.is_empty()) {
            Some(address) => Some(address.to_string()),
            None if airport_side => raw.airport_address(),
            None => None,
        }
    }
}

/// Resolve missing coordinates through the gateway, then validate.
///
/// Records that fail validation, or whose address cannot be resolved, are
/// reported and excluded. An unavailable lookup service fails the whole batch.
pub async fn admit_batch(
    raws: Vec<RawRequest>,
    gateway: &LookupGateway,
    constraints: &ConstraintConfig,
) -> Result<Admission, ServiceError> {
    let mut admission = Admission::default();
    for mut raw in raws {
        let flight_id = raw.flight_id.map(FlightId);

        let mut unresolved = None;
        for side in [Side::Origin, Side::Destination] {
            match resolve_side(&mut raw, &side, gateway).await {
                Ok(()) => {}
                Err(Resolution::Service(err)) => return Err(err),
                Err(Resolution::Invalid(err)) => {
                    unresolved = Some(err);
                    break;
                }
            }
        }

        let result = match unresolved {
            Some(err) => Err(err),
            None => Request::admit(raw, constraints),
        };
        match result {
            Ok(request) => admission.admitted.push(request),
            Err(error) => {
                debug!(flight_id = ?flight_id, %error, "request excluded");
                admission.rejected.push(ValidationReport {
                    request_id: flight_id,
                    error,
                });
            }
        }
    }
    Ok(admission)
}

enum Resolution {
    Service(ServiceError),
    Invalid(ValidationError),
}

async fn resolve_side(
    raw: &mut RawRequest,
    side: &Side,
    gateway: &LookupGateway,
) -> Result<(), Resolution> {
    let present = match side {
        Side::Origin => raw.origin.is_some(),
        Side::Destination => raw.destination.is_some(),
    };
    if present {
        return Ok(());
    }
    let Some(address) = side.address(raw) else {
        return Ok(());
    };

    let coordinate: Coordinate = match gateway.resolve_coordinate(&address).await {
        Ok(coordinate) => coordinate,
        Err(err @ ServiceError::Unavailable(_)) => return Err(Resolution::Service(err)),
        Err(err) => {
            return Err(Resolution::Invalid(ValidationError::UnresolvedLocation {
                field: side.field(),
                address,
                reason: err.to_string(),
            }))
        }
    };
    match side {
        Side::Origin => raw.origin = Some(coordinate),
        Side::Destination => raw.destination = Some(coordinate),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::LookupCaches;
    use crate::config::ServiceConfig;
    use crate::test_helpers::{lax_terminal, raw_request, ScriptedRouter, StaticGeocoder};

    fn gateway(geocoder: StaticGeocoder) -> LookupGateway {
        LookupGateway::new(
            Arc::new(geocoder),
            Arc::new(ScriptedRouter::new()),
            Arc::new(LookupCaches::default()),
            ServiceConfig::default(),
            40.0,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn airport_side_is_geocoded_from_airport_and_terminal() {
        let geocoder = StaticGeocoder::new().with("LAX airport terminal T4", lax_terminal());
        let mut raw = raw_request(1, 0);
        raw.destination = None;
        raw.destination_address = None;

        let admission = admit_batch(vec![raw], &gateway(geocoder), &ConstraintConfig::default())
            .await
            .expect("admitted");
        assert!(admission.rejected.is_empty());
        assert_eq!(admission.admitted[0].destination, lax_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn unresolvable_and_invalid_records_are_reported() {
        let mut unknown_address = raw_request(1, 0);
        unknown_address.origin = None;
        unknown_address.origin_address = Some("Nowhere Hall".into());
        let mut no_user = raw_request(2, 0);
        no_user.user_id = None;
        let fine = raw_request(3, 0);

        let admission = admit_batch(
            vec![unknown_address, no_user, fine],
            &gateway(StaticGeocoder::new()),
            &ConstraintConfig::default(),
        )
        .await
        .expect("batch");

        assert_eq!(admission.admitted.len(), 1);
        assert_eq!(admission.rejected.len(), 2);
        assert!(matches!(
            admission.rejected[0].error,
            ValidationError::UnresolvedLocation { field: "origin", .. }
        ));
        assert_eq!(admission.rejected[1].request_id, Some(FlightId(2)));
        assert_eq!(
            admission.rejected[1].error,
            ValidationError::MissingField("user_id")
        );
    }
}
