//! Correlated telemetry bundle generation.

use chrono::{SubsecRound, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use telemetry_domain::{
    EmergencyIncidentData, GpsData, IncidentStatus, IncidentType, Position, Route, SimTime,
    TelemetryRecord, TrafficCameraData, Vehicle, VehicleData, WeatherCondition, WeatherData,
};

use crate::clock::SimulationClock;
use crate::tracker::{reached, PositionTracker};

const DIRECTION: &str = "North-East";
const CAMERA_ID: &str = "Intelligent AI-powered Camera";

/// The five records of one tick, sharing time and position.
#[derive(Debug, Clone)]
pub struct TelemetryBundle {
    /// 1-based tick number
    pub tick: u64,
    pub time: SimTime,
    pub position: Position,
    /// Vehicle, GPS, traffic camera, weather, emergency, in that order
    pub records: [TelemetryRecord; 5],
    pub destination_reached: bool,
}

impl TelemetryBundle {
    /// Split into the records and the terminal flag.
    pub fn into_parts(self) -> ([TelemetryRecord; 5], bool) {
        (self.records, self.destination_reached)
    }
}

/// Composes one correlated bundle per call.
#[derive(Debug, Clone)]
pub struct TelemetryBundleGenerator {
    clock: SimulationClock,
    tracker: PositionTracker,
    route: Route,
    rng: StdRng,
    tick: u64,
}

impl TelemetryBundleGenerator {
    /// Start at `route.start()` at `start_time`. A seed makes every random draw
    /// reproducible (record ids stay unique regardless).
    pub fn new(route: Route, start_time: SimTime, seed: Option<u64>) -> Self {
        let (clock, tracker, rng) = match seed {
            Some(seed) => (
                SimulationClock::seeded(start_time, seed),
                PositionTracker::seeded(route.start(), seed.wrapping_add(1)),
                StdRng::seed_from_u64(seed.wrapping_add(2)),
            ),
            None => (
                SimulationClock::from_entropy(start_time),
                PositionTracker::new(route.start(), StdRng::from_entropy()),
                StdRng::from_entropy(),
            ),
        };

        Self {
            clock,
            tracker,
            route,
            rng,
            tick: 0,
        }
    }

    /// Default route starting now, truncated to whole seconds.
    pub fn starting_now(route: Route, seed: Option<u64>) -> Self {
        Self::new(route, Utc::now().trunc_subsecs(0), seed)
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Advance time, then position, then build the bundle and evaluate arrival.
    pub fn generate(&mut self, vehicle: &Vehicle) -> TelemetryBundle {
        let time = self.clock.advance();
        let position = self.tracker.advance(self.route.increments());
        self.tick += 1;

        let records = [
            TelemetryRecord::Vehicle(self.vehicle_data(vehicle, time, position)),
            TelemetryRecord::Gps(self.gps_data(vehicle, time)),
            TelemetryRecord::TrafficCamera(Self::traffic_data(vehicle, time, position)),
            TelemetryRecord::Weather(self.weather_data(vehicle, time, position)),
            TelemetryRecord::EmergencyIncident(self.emergency_data(vehicle, time, position)),
        ];

        TelemetryBundle {
            tick: self.tick,
            time,
            position,
            records,
            destination_reached: reached(&position, &self.route.destination()),
        }
    }

    fn vehicle_data(&mut self, vehicle: &Vehicle, time: SimTime, location: Position) -> VehicleData {
        VehicleData {
            id: Uuid::new_v4(),
            vehicle_id: vehicle.vehicle_id.clone(),
            timestamp: time,
            location,
            speed: self.rng.gen_range(10.0..40.0),
            direction: DIRECTION.to_string(),
            make: vehicle.make.clone(),
            model: vehicle.model.clone(),
            year: vehicle.year,
            fuel_type: vehicle.fuel_type.clone(),
        }
    }

    fn gps_data(&mut self, vehicle: &Vehicle, time: SimTime) -> GpsData {
        GpsData {
            id: Uuid::new_v4(),
            vehicle_id: vehicle.vehicle_id.clone(),
            timestamp: time,
            speed: self.rng.gen_range(0.0..40.0),
            direction: DIRECTION.to_string(),
            vehicle_type: "private".to_string(),
        }
    }

    fn traffic_data(vehicle: &Vehicle, time: SimTime, location: Position) -> TrafficCameraData {
        TrafficCameraData {
            id: Uuid::new_v4(),
            vehicle_id: vehicle.vehicle_id.clone(),
            camera_id: CAMERA_ID.to_string(),
            location,
            timestamp: time,
            snapshot: "Base64EncodedString".to_string(),
        }
    }

    fn weather_data(&mut self, vehicle: &Vehicle, time: SimTime, location: Position) -> WeatherData {
        WeatherData {
            id: Uuid::new_v4(),
            vehicle_id: vehicle.vehicle_id.clone(),
            location,
            timestamp: time,
            temperature: self.rng.gen_range(-5.0..26.0),
            weather_condition: *WeatherCondition::ALL
                .choose(&mut self.rng)
                .unwrap_or(&WeatherCondition::Sunny),
            precipitation: self.rng.gen_range(0.0..25.0),
            wind_speed: self.rng.gen_range(0.0..100.0),
            humidity: self.rng.gen_range(0..=100),
            air_quality_index: self.rng.gen_range(0.0..500.0),
        }
    }

    fn emergency_data(
        &mut self,
        vehicle: &Vehicle,
        time: SimTime,
        location: Position,
    ) -> EmergencyIncidentData {
        EmergencyIncidentData {
            id: Uuid::new_v4(),
            vehicle_id: vehicle.vehicle_id.clone(),
            incident_id: Uuid::new_v4(),
            incident_type: *IncidentType::ALL
                .choose(&mut self.rng)
                .unwrap_or(&IncidentType::None),
            timestamp: time,
            location,
            status: *IncidentStatus::ALL
                .choose(&mut self.rng)
                .unwrap_or(&IncidentStatus::Active),
            description: "Description of the incident".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use telemetry_domain::{Increments, Topic};

    fn start_time() -> SimTime {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn short_route() -> Route {
        Route::new(
            Position::new(51.5, -0.1),
            Position::new(52.4, -1.0),
            Increments {
                latitude: 0.01,
                longitude: -0.01,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_bundle_is_correlated() {
        let mut generator = TelemetryBundleGenerator::new(short_route(), start_time(), Some(11));
        let vehicle = Vehicle::default();

        for _ in 0..25 {
            let bundle = generator.generate(&vehicle);
            let topics: Vec<Topic> = bundle.records.iter().map(TelemetryRecord::topic).collect();
            assert_eq!(topics, Topic::ALL.to_vec());

            for record in &bundle.records {
                assert_eq!(record.timestamp(), bundle.time);
                assert_eq!(record.vehicle_id(), vehicle.vehicle_id);
                match record {
                    TelemetryRecord::Gps(_) => assert!(record.location().is_none()),
                    _ => assert_eq!(record.location(), Some(bundle.position)),
                }
            }

            let ids: HashSet<Uuid> = bundle.records.iter().map(TelemetryRecord::id).collect();
            assert_eq!(ids.len(), 5);
        }
    }

    #[test]
    fn test_time_strictly_increases() {
        let mut generator = TelemetryBundleGenerator::new(short_route(), start_time(), Some(5));
        let vehicle = Vehicle::default();
        let mut previous = start_time();

        for _ in 0..50 {
            let bundle = generator.generate(&vehicle);
            let step = (bundle.time - previous).num_seconds();
            assert!((30..=60).contains(&step));
            previous = bundle.time;
        }
        assert_eq!(generator.ticks(), 50);
    }

    #[test]
    fn test_terminal_flag_matches_predicate() {
        let mut generator = TelemetryBundleGenerator::new(short_route(), start_time(), Some(21));
        let vehicle = Vehicle::default();

        let bundle = loop {
            let bundle = generator.generate(&vehicle);
            assert_eq!(
                bundle.destination_reached,
                reached(&bundle.position, &short_route().destination())
            );
            if bundle.destination_reached {
                break bundle;
            }
            assert!(bundle.tick < 200);
        };
        assert!((88..=92).contains(&bundle.tick), "tick {}", bundle.tick);

        let (records, terminal) = bundle.into_parts();
        assert!(terminal);
        assert_eq!(records.len(), 5);
    }

    #[test]
    fn test_field_ranges() {
        let mut generator = TelemetryBundleGenerator::new(short_route(), start_time(), Some(3));
        let vehicle = Vehicle::new("V-77");

        for _ in 0..100 {
            let bundle = generator.generate(&vehicle);
            for record in &bundle.records {
                match record {
                    TelemetryRecord::Vehicle(v) => {
                        assert!((10.0..40.0).contains(&v.speed));
                        assert_eq!(v.make, "Tesla");
                        assert_eq!(v.vehicle_id, "V-77");
                    }
                    TelemetryRecord::Gps(g) => assert!((0.0..40.0).contains(&g.speed)),
                    TelemetryRecord::Weather(w) => {
                        assert!((0..=100).contains(&w.humidity));
                        assert!((-5.0..26.0).contains(&w.temperature));
                        assert!((0.0..500.0).contains(&w.air_quality_index));
                    }
                    TelemetryRecord::TrafficCamera(t) => assert_eq!(t.camera_id, CAMERA_ID),
                    TelemetryRecord::EmergencyIncident(e) => assert_ne!(e.incident_id, e.id),
                }
            }
        }
    }
}
