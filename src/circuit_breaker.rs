use failsafe::backoff::{self, Exponential};
use failsafe::failure_policy::{self, ConsecutiveFailures};
use failsafe::{Config, StateMachine};
use std::time::Duration;

/// Circuit breaker guarding one external gateway.
pub type GatewayBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

/// Creates a circuit breaker for a gateway so a dead source fails fast and
/// the fallback chain takes over.
///
/// # Configuration
///
/// - **Failure threshold**: 5 consecutive failures triggers OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
///
/// # States
///
/// - **CLOSED**: Normal operation, requests pass through.
/// - **OPEN**: Too many failures, calls return `FetchError::CircuitOpen`.
/// - **HALF_OPEN**: Testing if the source recovered.
///
/// Only transport-level failures (after retries) are reported as errors;
/// a 4xx answer means the source is alive.
pub fn create_gateway_circuit_breaker() -> GatewayBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use failsafe::{CircuitBreaker, Error};

    #[test]
    fn test_circuit_breaker_opens_after_failures() {
        let cb = create_gateway_circuit_breaker();

        for _ in 0..5 {
            let result: Result<(), Error<&str>> = cb.call(|| Err::<(), &str>("timeout"));
            assert!(result.is_err());
        }

        let result: Result<(), Error<&str>> = cb.call(|| Ok::<(), &str>(()));
        match result {
            Err(Error::Rejected) => {}
            _ => panic!("Expected circuit to be open and reject requests"),
        }
    }

    #[test]
    fn test_manual_reporting_opens_circuit() {
        let cb = create_gateway_circuit_breaker();
        assert!(cb.is_call_permitted());

        for _ in 0..5 {
            cb.on_error();
        }
        assert!(!cb.is_call_permitted());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = create_gateway_circuit_breaker();
        for _ in 0..4 {
            cb.on_error();
        }
        cb.on_success();
        for _ in 0..4 {
            cb.on_error();
        }
        assert!(cb.is_call_permitted());
    }
}
