//! Access decisions for RFID scans at this node's gate.
//!
//! Every decision is recorded: denials append a `DENIED`/`FAIL` log, grants
//! move the holder's presence status and append a `PASS` log in the same
//! transaction, so both replicate like any other local write.

use serde::{Deserialize, Serialize};

use crate::config::GateConfig;
use crate::error::{Error, Result};
use crate::models::{
    AccessResult, EventType, GateKind, NewAccessLog, User, UserPatch, UserStatus, UserType,
};
use crate::sync::{ChangeRecorder, RecordingTx};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub rfid_tag: String,
    /// Must match the node's gate when given
    #[serde(default)]
    pub gate_id: Option<i64>,
    pub booth_id: i64,
    #[serde(default)]
    pub device_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResponse {
    pub result: AccessResult,
    pub message: String,
    pub event_type: EventType,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
}

impl ScanResponse {
    pub fn granted(&self) -> bool {
        self.result == AccessResult::Pass
    }
}

/// Presence transition a scan would make: the event and the status after it.
///
/// `None` for holders whose status does not allow passing at all.
pub const fn next_event(status: UserStatus) -> Option<(EventType, UserStatus)> {
    match status {
        UserStatus::Idle | UserStatus::Out => Some((EventType::Entry, UserStatus::In)),
        UserStatus::In => Some((EventType::Exit, UserStatus::Out)),
        UserStatus::Expired | UserStatus::Banned => None,
    }
}

/// Common gates only let people through one way.
pub const fn direction_allowed(gate: GateKind, event: EventType) -> bool {
    !matches!(
        (gate, event),
        (GateKind::CommonIn, EventType::Exit) | (GateKind::CommonOut, EventType::Entry)
    )
}

/// VIP and backstage gates admit only their own holders.
pub const fn audience_allowed(gate: GateKind, user_type: UserType) -> bool {
    match gate {
        GateKind::Vip => matches!(user_type, UserType::Vip),
        GateKind::Backstage => matches!(user_type, UserType::Backstage),
        GateKind::CommonIn | GateKind::CommonOut => true,
    }
}

#[derive(Clone)]
pub struct AccessController {
    recorder: ChangeRecorder,
    gate: GateConfig,
}

impl AccessController {
    pub const fn new(recorder: ChangeRecorder, gate: GateConfig) -> Self {
        Self { recorder, gate }
    }

    pub const fn gate(&self) -> GateConfig {
        self.gate
    }

    /// Decide a scan and record the outcome.
    ///
    /// Denials are an `Ok` response with `result = FAIL`; `Err` is reserved
    /// for malformed requests and storage failures.
    pub fn process_scan(&self, request: &ScanRequest) -> Result<ScanResponse> {
        let rfid_tag = request.rfid_tag.trim();
        if rfid_tag.is_empty() {
            return Err(Error::InvalidInput("RFID tag cannot be empty".to_string()));
        }
        if let Some(gate_id) = request.gate_id {
            if gate_id != self.gate.gate_id {
                return Err(Error::InvalidInput(format!(
                    "scan for gate {gate_id} reached the node at gate {}",
                    self.gate.gate_id
                )));
            }
        }

        let response = self.recorder.record(|scope| {
            let Some(user) = scope.users().find_by_tag(rfid_tag)? else {
                return self.deny(scope, request, None, "Unknown RFID tag".to_string());
            };
            self.decide(scope, request, &user)
        })?;

        if response.granted() {
            tracing::info!(
                gate = self.gate.gate_id,
                booth = request.booth_id,
                user_id = response.user_id,
                event = response.event_type.as_str(),
                "Access granted"
            );
        } else {
            tracing::info!(
                gate = self.gate.gate_id,
                booth = request.booth_id,
                user_id = response.user_id,
                "Access denied: {}",
                response.message
            );
        }
        Ok(response)
    }

    fn decide(&self, scope: &RecordingTx<'_>, request: &ScanRequest, user: &User) -> Result<ScanResponse> {
        if user.is_deleted {
            return self.deny(scope, request, Some(user), "Access denied - deleted".to_string());
        }
        if !user.is_active {
            return self.deny(scope, request, Some(user), "Access denied - inactive".to_string());
        }
        let Some((event, next_status)) = next_event(user.status) else {
            return self.deny(scope, request, Some(user), format!("Access denied - {}", user.status));
        };
        if !direction_allowed(self.gate.kind, event) {
            return self.deny(scope, request, Some(user), "Wrong direction for this gate".to_string());
        }
        if !audience_allowed(self.gate.kind, user.user_type) {
            let message = format!("Access denied - gate restricted to {}", self.gate.kind);
            return self.deny(scope, request, Some(user), message);
        }

        let patch = UserPatch {
            status: Some(next_status),
            last_gate_id: Some(self.gate.gate_id),
            last_booth_id: Some(request.booth_id),
            ..UserPatch::default()
        };
        scope.update_user(user.id, &patch)?;

        let message = format!("Access granted - {}", event.as_str());
        scope.append_log(
            self.log(request, event, AccessResult::Pass)
                .with_user(user.id)
                .with_message(message.clone()),
        )?;
        Ok(ScanResponse {
            result: AccessResult::Pass,
            message,
            event_type: event,
            user_id: Some(user.id),
            user_name: user.name.clone(),
        })
    }

    fn deny(
        &self,
        scope: &RecordingTx<'_>,
        request: &ScanRequest,
        user: Option<&User>,
        message: String,
    ) -> Result<ScanResponse> {
        let mut log = self
            .log(request, EventType::Denied, AccessResult::Fail)
            .with_message(message.clone());
        if let Some(user) = user {
            log = log.with_user(user.id);
        }
        scope.append_log(log)?;
        Ok(ScanResponse {
            result: AccessResult::Fail,
            message,
            event_type: EventType::Denied,
            user_id: user.map(|user| user.id),
            user_name: user.and_then(|user| user.name.clone()),
        })
    }

    fn log(&self, request: &ScanRequest, event: EventType, result: AccessResult) -> NewAccessLog {
        let log = NewAccessLog::new(event, result, self.gate.gate_id, request.booth_id);
        match request.device_id {
            Some(device_id) => log.with_device(device_id),
            None => log,
        }
    }
}
