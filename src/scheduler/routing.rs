//! Queueable vs dispatchable method sets

use crate::config::CreateBehavior;
use crate::error::{MatchmakingError, Result};
use crate::types::MatchMethod;

/// Path a method takes through the matchmaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Queue,
    Dispatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRouting {
    queueable: Vec<MatchMethod>,
    dispatchable: Vec<MatchMethod>,
}

impl MethodRouting {
    /// Explicit method sets; a method may not appear in both
    pub fn new(queueable: Vec<MatchMethod>, dispatchable: Vec<MatchMethod>) -> Result<Self> {
        if let Some(method) = queueable.iter().find(|m| dispatchable.contains(m)) {
            return Err(MatchmakingError::ConfigurationError {
                message: format!("method {} cannot be both queued and dispatched", method),
            }
            .into());
        }
        Ok(Self {
            queueable,
            dispatchable,
        })
    }

    pub fn from_create_behavior(behavior: CreateBehavior) -> Self {
        let mut queueable = vec![MatchMethod::JoinOrCreate, MatchMethod::Join];
        let mut dispatchable = vec![MatchMethod::JoinById, MatchMethod::Reconnect];
        match behavior {
            CreateBehavior::Queue => queueable.push(MatchMethod::Create),
            CreateBehavior::Dispatch => dispatchable.push(MatchMethod::Create),
        }
        Self {
            queueable,
            dispatchable,
        }
    }

    pub fn queueable(&self) -> &[MatchMethod] {
        &self.queueable
    }

    pub fn dispatchable(&self) -> &[MatchMethod] {
        &self.dispatchable
    }

    pub fn route(&self, method: MatchMethod) -> Result<Route> {
        if self.queueable.contains(&method) {
            Ok(Route::Queue)
        } else if self.dispatchable.contains(&method) {
            Ok(Route::Dispatch)
        } else {
            Err(MatchmakingError::UnsupportedOperation {
                message: format!("method {} is neither queueable nor dispatchable", method),
            }
            .into())
        }
    }
}

impl Default for MethodRouting {
    fn default() -> Self {
        Self::from_create_behavior(CreateBehavior::Dispatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_behavior_moves_create() {
        let dispatch = MethodRouting::from_create_behavior(CreateBehavior::Dispatch);
        assert_eq!(dispatch.route(MatchMethod::Create).unwrap(), Route::Dispatch);
        assert_eq!(dispatch.route(MatchMethod::JoinOrCreate).unwrap(), Route::Queue);
        assert_eq!(dispatch.route(MatchMethod::Reconnect).unwrap(), Route::Dispatch);

        let queue = MethodRouting::from_create_behavior(CreateBehavior::Queue);
        assert_eq!(queue.route(MatchMethod::Create).unwrap(), Route::Queue);
        assert_eq!(queue.route(MatchMethod::JoinById).unwrap(), Route::Dispatch);
    }

    #[test]
    fn test_unrouted_method_is_unsupported() {
        let routing = MethodRouting::new(vec![MatchMethod::Join], vec![]).unwrap();
        let err = routing.route(MatchMethod::Create).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn test_overlapping_sets_rejected() {
        assert!(MethodRouting::new(vec![MatchMethod::Join], vec![MatchMethod::Join]).is_err());
    }
}
