//! Proof-of-wakefulness requirements and the verifier port.
//!
//! The engine never inspects a submission itself. It only moves a session
//! from `ProofPending` to `Dismissed` when the host's verifier says yes.

use serde::{Deserialize, Serialize};

use crate::session::SessionId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProofRequirement {
    /// Photo must match a reference image captured at setup.
    PhotoMatch { reference_id: String },
    StepCount { steps: u32 },
    MathChallenge { problems: u8 },
    TypedPhrase { phrase: String },
    StretchPose { pose: String },
}

impl ProofRequirement {
    pub fn name(&self) -> &'static str {
        match self {
            ProofRequirement::PhotoMatch { .. } => "photo_match",
            ProofRequirement::StepCount { .. } => "step_count",
            ProofRequirement::MathChallenge { .. } => "math_challenge",
            ProofRequirement::TypedPhrase { .. } => "typed_phrase",
            ProofRequirement::StretchPose { .. } => "stretch_pose",
        }
    }
}

/// What the verifier is asked to check. Also persisted in the heartbeat
/// record so a resumed session knows which proof is outstanding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofContext {
    pub session_id: SessionId,
    pub alarm_id: String,
    #[serde(default)]
    pub requirement: Option<ProofRequirement>,
    /// Host-supplied evidence (photo id, step count, typed text, ...).
    #[serde(default)]
    pub submission: Option<serde_json::Value>,
}

impl ProofContext {
    pub fn new(
        session_id: SessionId,
        alarm_id: &str,
        requirement: Option<ProofRequirement>,
    ) -> Self {
        Self {
            session_id,
            alarm_id: alarm_id.to_string(),
            requirement,
            submission: None,
        }
    }

    pub fn requires_proof(&self) -> bool {
        self.requirement.is_some()
    }
}

/// Camera, pedometer, math or typing check implemented by the host.
pub trait ProofVerifier: Send + Sync {
    /// `Ok(false)` is a rejected proof; `Err` means the check itself failed.
    fn verify(&self, context: &ProofContext) -> Result<bool, Box<dyn std::error::Error + Send + Sync>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirement_is_tagged_by_kind() {
        let req = ProofRequirement::TypedPhrase {
            phrase: "I am awake".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["kind"], "typed_phrase");
        assert_eq!(json["phrase"], "I am awake");
        assert_eq!(req.name(), "typed_phrase");
    }

    #[test]
    fn context_without_requirement_needs_no_proof() {
        let ctx = ProofContext::new(SessionId::from("sess-x"), "a", None);
        assert!(!ctx.requires_proof());
        let back: ProofContext =
            serde_json::from_str(&serde_json::to_string(&ctx).unwrap()).unwrap();
        assert_eq!(back, ctx);
    }
}
