//! Arrival/departure notifications and emergency fan-out through the full
//! engine, observed at the dispatcher.

mod common;

use chrono::{Duration, Utc};
use common::*;
use tether::emergency::{EmergencyAlerts, EmergencyKind};
use tether::geofence_worker::GeofenceJob;
use tether::notifications::NotificationChannel;
use tether::places::PlaceNotifyPolicy;
use tether::protocol::{EmergencyAlertRequest, FrameType};
use uuid::Uuid;

const PLACE_LAT: f64 = 37.7749;
const PLACE_LON: f64 = -122.4194;

fn arrival_policy(extra: Vec<Uuid>) -> PlaceNotifyPolicy {
    PlaceNotifyPolicy {
        on_arrival: true,
        on_departure: false,
        on_long_stay: false,
        long_stay_minutes: None,
        notify_members: extra,
    }
}

#[tokio::test]
async fn arrival_notifies_circle_members_but_not_the_actor() {
    let engine = engine();
    let ana = make_user(&engine, "Ana");
    let bruno = make_user(&engine, "Bruno");
    let carla = make_user(&engine, "Carla");
    let circle = make_circle(&engine, &[ana, bruno, carla]);
    make_place(
        &engine,
        ana,
        Some(circle),
        PLACE_LAT,
        PLACE_LON,
        100.0,
        arrival_policy(vec![]),
    );

    let t = Utc::now();
    for (lat, lon, offset) in [(37.7760, -122.4200, 0), (37.77495, -122.41945, 5)] {
        engine
            .geofence
            .submit(GeofenceJob {
                user_id: ana,
                location: sample_at(ana, lat, lon, t + Duration::seconds(offset)),
            })
            .unwrap();
    }

    wait_until(|| {
        let dispatcher = engine.dispatcher.clone();
        async move {
            let recipients: std::collections::HashSet<Uuid> =
                dispatcher.deliveries().iter().map(|d| d.1).collect();
            recipients.contains(&bruno) && recipients.contains(&carla)
        }
    })
    .await;

    let deliveries = engine.dispatcher.deliveries();
    assert!(deliveries.iter().all(|d| d.1 != ana));
    assert!(deliveries.iter().any(|d| d.2.contains("arrived")));
}

#[tokio::test]
async fn extra_notify_members_are_included() {
    let engine = engine();
    let ana = make_user(&engine, "Ana");
    let grandma = make_user(&engine, "Dora");
    let circle = make_circle(&engine, &[ana]);
    make_place(
        &engine,
        ana,
        Some(circle),
        PLACE_LAT,
        PLACE_LON,
        100.0,
        arrival_policy(vec![grandma]),
    );

    let t = Utc::now();
    for (lat, lon, offset) in [(37.7760, -122.4200, 0), (37.77495, -122.41945, 5)] {
        engine
            .geofence
            .submit(GeofenceJob {
                user_id: ana,
                location: sample_at(ana, lat, lon, t + Duration::seconds(offset)),
            })
            .unwrap();
    }

    wait_until(|| {
        let dispatcher = engine.dispatcher.clone();
        async move { dispatcher.deliveries().iter().any(|d| d.1 == grandma) }
    })
    .await;
}

#[tokio::test]
async fn silent_policy_produces_no_notifications() {
    let engine = engine();
    let ana = make_user(&engine, "Ana");
    let bruno = make_user(&engine, "Bruno");
    let circle = make_circle(&engine, &[ana, bruno]);
    let place = make_place(
        &engine,
        ana,
        Some(circle),
        PLACE_LAT,
        PLACE_LON,
        100.0,
        PlaceNotifyPolicy::default(),
    );

    let t = Utc::now();
    for (lat, lon, offset) in [(37.7760, -122.4200, 0), (37.77495, -122.41945, 5)] {
        engine
            .geofence
            .submit(GeofenceJob {
                user_id: ana,
                location: sample_at(ana, lat, lon, t + Duration::seconds(offset)),
            })
            .unwrap();
    }

    // The visit still opens; the dispatcher stays silent.
    wait_until(|| {
        let places = engine.places.clone();
        async move { !places.visits_for(ana, place).is_empty() }
    })
    .await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(engine.dispatcher.deliveries().is_empty());
}

#[tokio::test]
async fn emergency_pages_every_peer_and_reaches_live_connections() {
    let engine = engine();
    let ana = make_user(&engine, "Ana");
    let bruno = make_user(&engine, "Bruno");
    let circle = make_circle(&engine, &[ana, bruno]);
    let (_bruno_client, bruno_rx) = connect(&engine, bruno, vec![circle]).await;

    let alerts = EmergencyAlerts::new(
        engine.hub.clone(),
        engine.circles.clone(),
        engine.users.clone(),
        engine.notifications.clone(),
    );
    let event = alerts
        .raise(
            ana,
            EmergencyAlertRequest {
                kind: EmergencyKind::Sos,
                latitude: PLACE_LAT,
                longitude: PLACE_LON,
                message: Some("need help".to_string()),
            },
        )
        .await
        .unwrap();

    // Live broadcast to the room.
    let frame = tokio::time::timeout(std::time::Duration::from_secs(2), async {
        loop {
            let frame = bruno_rx.recv_async().await.unwrap();
            if frame.kind == FrameType::EmergencyAlert {
                return frame;
            }
        }
    })
    .await
    .expect("emergency broadcast");
    assert_eq!(frame.data["eventId"], serde_json::json!(event.id));
    assert_eq!(frame.data["kind"], "sos");

    // Urgent page lands at the dispatcher for the peer only.
    wait_until(|| {
        let dispatcher = engine.dispatcher.clone();
        async move { dispatcher.deliveries().iter().any(|d| d.1 == bruno) }
    })
    .await;
    assert!(engine.dispatcher.deliveries().iter().all(|d| d.1 != ana));
}

#[tokio::test]
async fn invalid_emergency_coordinates_are_rejected() {
    let engine = engine();
    let ana = make_user(&engine, "Ana");
    make_circle(&engine, &[ana]);

    let alerts = EmergencyAlerts::new(
        engine.hub.clone(),
        engine.circles.clone(),
        engine.users.clone(),
        engine.notifications.clone(),
    );
    let err = alerts
        .raise(
            ana,
            EmergencyAlertRequest {
                kind: EmergencyKind::Sos,
                latitude: 123.0,
                longitude: 0.0,
                message: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, tether::error::FrameError::InvalidLocation(_)));
}

#[tokio::test]
async fn deliveries_use_addressable_channels() {
    let engine = engine();
    let ana = make_user(&engine, "Ana");
    let bruno = make_user(&engine, "Bruno");
    let circle = make_circle(&engine, &[ana, bruno]);
    make_place(
        &engine,
        ana,
        Some(circle),
        PLACE_LAT,
        PLACE_LON,
        100.0,
        arrival_policy(vec![]),
    );

    let t = Utc::now();
    for (lat, lon, offset) in [(37.7760, -122.4200, 0), (37.77495, -122.41945, 5)] {
        engine
            .geofence
            .submit(GeofenceJob {
                user_id: ana,
                location: sample_at(ana, lat, lon, t + Duration::seconds(offset)),
            })
            .unwrap();
    }

    wait_until(|| {
        let dispatcher = engine.dispatcher.clone();
        async move { !dispatcher.deliveries().is_empty() }
    })
    .await;
    let channels: std::collections::HashSet<NotificationChannel> = engine
        .dispatcher
        .deliveries()
        .iter()
        .map(|d| d.0)
        .collect();
    // The fixture users carry push, sms, and email addresses.
    assert!(channels.contains(&NotificationChannel::Push));
}
