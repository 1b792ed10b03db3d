//! State-change events published through the [`EventBus`](crate::event_bus::EventBus).
//!
//! Serialized as `{"event": "<name>", "data": {...}}` with camelCase names so
//! a transport can forward them verbatim.

use serde::Serialize;

use crate::cruise::CruiseSnapshot;
use crate::route::{Route, RouteSnapshot, Waypoint};

/// Payload of `cruiseStopped`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CruiseStoppedEvent {
    pub device_id: String,
    pub reason: String,
}

/// Payload of `cruiseError`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CruiseErrorEvent {
    pub device_id: String,
    pub error: String,
}

/// Payload of `routeWaypointAdded`. `waypoint` is absent for undo.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaypointEvent {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waypoint: Option<Waypoint>,
    pub route: Route,
}

/// Every event the simulation core emits.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum SimEvent {
    CruiseStarted(CruiseSnapshot),
    CruiseUpdate(CruiseSnapshot),
    CruisePaused(CruiseSnapshot),
    CruiseResumed(CruiseSnapshot),
    CruiseArrived(CruiseSnapshot),
    CruiseStopped(CruiseStoppedEvent),
    CruiseError(CruiseErrorEvent),
    RouteWaypointAdded(WaypointEvent),
    RouteStarted(RouteSnapshot),
    RouteUpdate(RouteSnapshot),
    RouteSegmentComplete(RouteSnapshot),
    RouteLoopComplete(RouteSnapshot),
    RouteArrived(RouteSnapshot),
}

impl SimEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            SimEvent::CruiseStarted(_) => "cruiseStarted",
            SimEvent::CruiseUpdate(_) => "cruiseUpdate",
            SimEvent::CruisePaused(_) => "cruisePaused",
            SimEvent::CruiseResumed(_) => "cruiseResumed",
            SimEvent::CruiseArrived(_) => "cruiseArrived",
            SimEvent::CruiseStopped(_) => "cruiseStopped",
            SimEvent::CruiseError(_) => "cruiseError",
            SimEvent::RouteWaypointAdded(_) => "routeWaypointAdded",
            SimEvent::RouteStarted(_) => "routeStarted",
            SimEvent::RouteUpdate(_) => "routeUpdate",
            SimEvent::RouteSegmentComplete(_) => "routeSegmentComplete",
            SimEvent::RouteLoopComplete(_) => "routeLoopComplete",
            SimEvent::RouteArrived(_) => "routeArrived",
        }
    }

    /// Device the event refers to.
    pub fn device_id(&self) -> &str {
        match self {
            SimEvent::CruiseStarted(s)
            | SimEvent::CruiseUpdate(s)
            | SimEvent::CruisePaused(s)
            | SimEvent::CruiseResumed(s)
            | SimEvent::CruiseArrived(s) => &s.device_id,
            SimEvent::CruiseStopped(e) => &e.device_id,
            SimEvent::CruiseError(e) => &e.device_id,
            SimEvent::RouteWaypointAdded(e) => &e.device_id,
            SimEvent::RouteStarted(s)
            | SimEvent::RouteUpdate(s)
            | SimEvent::RouteSegmentComplete(s)
            | SimEvent::RouteLoopComplete(s)
            | SimEvent::RouteArrived(s) => &s.device_id,
        }
    }

    /// JSON text of the event, `{"event": ..., "data": ...}`.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"event":"{}","data":null}}"#, self.name())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopped_event_json_shape() {
        let event = SimEvent::CruiseStopped(CruiseStoppedEvent {
            device_id: "device-1".to_string(),
            reason: "stopped".to_string(),
        });
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["event"], "cruiseStopped");
        assert_eq!(value["data"]["deviceId"], "device-1");
        assert_eq!(value["data"]["reason"], "stopped");
        assert_eq!(event.device_id(), "device-1");
    }

    #[test]
    fn test_waypoint_event_omits_missing_waypoint() {
        let event = SimEvent::RouteWaypointAdded(WaypointEvent {
            device_id: "device-1".to_string(),
            waypoint: None,
            route: Route::default(),
        });
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["event"], "routeWaypointAdded");
        assert!(value["data"].get("waypoint").is_none());
        assert_eq!(value["data"]["route"]["loopMode"], false);
    }
}
