//! Per-type payload schemas.
//!
//! Every [`EventType`] must have a registered schema; [`SchemaRegistry::ensure_complete`]
//! is run when a store is opened so a missing registration fails at startup
//! rather than at the first append of that type.

use std::collections::HashMap;

use conclave_types::{CeremonyState, EventDraft, EventPayload, EventType};

use crate::error::LedgerError;

type Validator = fn(&EventPayload) -> Result<(), String>;

#[derive(Clone, Copy)]
pub struct EventSchema {
    pub current_version: u16,
    pub min_version: u16,
    validator: Validator,
}

impl EventSchema {
    pub fn new(current_version: u16, validator: Validator) -> Self {
        Self {
            current_version,
            min_version: 1,
            validator,
        }
    }
}

impl std::fmt::Debug for EventSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSchema")
            .field("current_version", &self.current_version)
            .field("min_version", &self.min_version)
            .finish()
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<EventType, EventSchema>,
}

impl SchemaRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Schemas for the whole event catalogue.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for ty in EventType::ALL {
            registry.register(ty, EventSchema::new(1, standard_validator(ty)));
        }
        registry
    }

    pub fn register(&mut self, event_type: EventType, schema: EventSchema) {
        self.schemas.insert(event_type, schema);
    }

    pub fn get(&self, event_type: EventType) -> Option<&EventSchema> {
        self.schemas.get(&event_type)
    }

    /// Fail if any event type lacks a schema.
    pub fn ensure_complete(&self) -> Result<(), LedgerError> {
        match EventType::ALL.iter().find(|ty| !self.schemas.contains_key(ty)) {
            Some(missing) => Err(LedgerError::UnregisteredType(*missing)),
            None => Ok(()),
        }
    }

    pub fn current_version(&self, event_type: EventType) -> Result<u16, LedgerError> {
        self.get(event_type)
            .map(|s| s.current_version)
            .ok_or(LedgerError::UnregisteredType(event_type))
    }

    pub fn validate(&self, draft: &EventDraft) -> Result<(), LedgerError> {
        let schema = self
            .get(draft.event_type)
            .ok_or(LedgerError::UnregisteredType(draft.event_type))?;

        let violation = |reason: String| LedgerError::SchemaViolation {
            event_type: draft.event_type,
            reason,
        };

        if draft.payload.event_type() != draft.event_type {
            return Err(violation(format!(
                "payload is {} but draft declares {}",
                draft.payload.event_type(),
                draft.event_type
            )));
        }
        if draft.payload_version < schema.min_version || draft.payload_version > schema.current_version {
            return Err(violation(format!(
                "payload version {} outside {}..={}",
                draft.payload_version, schema.min_version, schema.current_version
            )));
        }
        (schema.validator)(&draft.payload).map_err(violation)
    }
}

fn non_empty(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{field} must not be empty"))
    } else {
        Ok(())
    }
}

fn standard_validator(event_type: EventType) -> Validator {
    match event_type {
        EventType::HaltTriggered => |p| match p {
            EventPayload::HaltTriggered { reason, source, .. } => {
                non_empty("reason", reason)?;
                non_empty("source", &source.0)
            }
            _ => Err("wrong payload".into()),
        },
        EventType::HaltCleared => |_| Ok(()),
        EventType::HaltEscalated => |p| match p {
            EventPayload::HaltEscalated {
                window_triggers,
                sources,
            } => {
                if *window_triggers == 0 || sources.is_empty() {
                    Err("escalation needs triggers and sources".into())
                } else {
                    Ok(())
                }
            }
            _ => Err("wrong payload".into()),
        },
        EventType::CeremonyTransitioned => |p| match p {
            EventPayload::CeremonyTransitioned {
                ceremony_type,
                tier,
                subject,
                from,
                to,
                ..
            } => {
                if ceremony_type.tier() != *tier {
                    return Err(format!("{ceremony_type} is {}, not {tier}", ceremony_type.tier()));
                }
                if !subject.matches(*ceremony_type) {
                    return Err(format!("subject does not fit {ceremony_type}"));
                }
                let legal = match from {
                    None => *to == CeremonyState::Pending,
                    Some(from) => from.can_transition_to(*to),
                };
                if legal {
                    Ok(())
                } else {
                    Err(format!("illegal transition {from:?} -> {to}"))
                }
            }
            _ => Err("wrong payload".into()),
        },
        EventType::KeyActivated => |p| match p {
            EventPayload::KeyActivated {
                key_id, public_key, ..
            } => {
                non_empty("key_id", &key_id.0)?;
                if public_key.len() != 64 || !public_key.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err("public_key must be 32 hex-encoded bytes".into());
                }
                Ok(())
            }
            _ => Err("wrong payload".into()),
        },
        EventType::KeyRevoked => |p| match p {
            EventPayload::KeyRevoked { key_id, reason, .. } => {
                non_empty("key_id", &key_id.0)?;
                non_empty("reason", reason)
            }
            _ => Err("wrong payload".into()),
        },
        EventType::WriterFailover => |p| match p {
            EventPayload::WriterFailover {
                previous_writer,
                new_writer,
                ..
            } => {
                non_empty("new_writer", new_writer)?;
                if previous_writer == new_writer {
                    return Err("failover must change the writer".into());
                }
                Ok(())
            }
            _ => Err("wrong payload".into()),
        },
        EventType::AmendmentRatified => |p| match p {
            EventPayload::AmendmentRatified {
                amendment_kind,
                title,
                ..
            } => {
                non_empty("title", title)?;
                if amendment_kind.tier() == conclave_types::Tier::Tier1 {
                    return Err(format!("{amendment_kind} is not an amendment"));
                }
                Ok(())
            }
            _ => Err("wrong payload".into()),
        },
        EventType::IntegrityFault => |p| match p {
            EventPayload::IntegrityFault { fault_kind, .. } => non_empty("fault_kind", fault_kind),
            _ => Err("wrong payload".into()),
        },
        EventType::IdentityDeclared => |p| match p {
            EventPayload::IdentityDeclared { subject, .. } => non_empty("subject", subject),
            _ => Err("wrong payload".into()),
        },
        EventType::StateRecorded => |p| match p {
            EventPayload::StateRecorded {
                subject,
                state_kind,
                ..
            } => {
                non_empty("subject", subject)?;
                non_empty("state_kind", state_kind)
            }
            _ => Err("wrong payload".into()),
        },
        EventType::PrecedentEstablished => |p| match p {
            EventPayload::PrecedentEstablished { precedent_id, .. } => {
                non_empty("precedent_id", precedent_id)
            }
            _ => Err("wrong payload".into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conclave_types::{
        CeremonyId, CeremonySubject, CeremonyType, ContentHash, HaltId, LedgerHead, SourceId, Tier,
    };

    fn draft(payload: EventPayload) -> EventDraft {
        EventDraft::unsigned(&LedgerHead::genesis(), payload, 1, Utc::now())
    }

    #[test]
    fn standard_registry_is_complete() {
        assert!(SchemaRegistry::standard().ensure_complete().is_ok());
    }

    #[test]
    fn missing_registration_fails_fast() {
        let mut registry = SchemaRegistry::empty();
        registry.register(
            EventType::HaltTriggered,
            EventSchema::new(1, standard_validator(EventType::HaltTriggered)),
        );
        assert!(matches!(
            registry.ensure_complete(),
            Err(LedgerError::UnregisteredType(_))
        ));
    }

    #[test]
    fn empty_reason_is_schema_violation() {
        let registry = SchemaRegistry::standard();
        let d = draft(EventPayload::HaltTriggered {
            halt_id: HaltId::new(),
            reason: "  ".into(),
            source: SourceId::new("watchdog"),
            escalated: false,
        });
        assert!(matches!(
            registry.validate(&d),
            Err(LedgerError::SchemaViolation { .. })
        ));
    }

    #[test]
    fn declared_type_must_match_payload() {
        let registry = SchemaRegistry::standard();
        let mut d = draft(EventPayload::IdentityDeclared {
            subject: "archon-1".into(),
            identity_hash: ContentHash::hash(b"id"),
        });
        d.event_type = EventType::StateRecorded;
        assert!(registry.validate(&d).is_err());
    }

    #[test]
    fn unsupported_version_rejected() {
        let registry = SchemaRegistry::standard();
        let mut d = draft(EventPayload::IdentityDeclared {
            subject: "archon-1".into(),
            identity_hash: ContentHash::hash(b"id"),
        });
        d.payload_version = 7;
        assert!(registry.validate(&d).is_err());
    }

    #[test]
    fn ceremony_transition_must_follow_table() {
        let registry = SchemaRegistry::standard();
        let transition = |from, to| {
            draft(EventPayload::CeremonyTransitioned {
                ceremony_id: CeremonyId::new(),
                ceremony_type: CeremonyType::HaltClear,
                tier: Tier::Tier1,
                subject: CeremonySubject::Halt {
                    halt_id: HaltId::new(),
                },
                from,
                to,
                audit_record_hash: ContentHash::hash(b"audit"),
            })
        };
        assert!(registry
            .validate(&transition(None, CeremonyState::Pending))
            .is_ok());
        assert!(registry
            .validate(&transition(Some(CeremonyState::Approved), CeremonyState::Executing))
            .is_ok());
        assert!(registry
            .validate(&transition(Some(CeremonyState::Pending), CeremonyState::Completed))
            .is_err());
    }
}
