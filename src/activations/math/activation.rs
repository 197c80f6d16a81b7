use async_stream::stream;
use futures::Stream;
use serde_json::{json, Value};

use super::types::MathOptions;
use crate::plugin_system::PluginDescriptor;
use crate::relay::{BusinessError, Relay, RelayError, Request};

/// Math service on topic `math`
///
/// - `cmd: add` / `cmd: sub` with numeric `a` and `b`, one reply
/// - `cmd: count` with `to`, streams `1..=to`; call it with `maxMessages$`
pub struct Math;

impl Math {
    pub const NAMESPACE: &'static str = "math";

    /// The service packaged as a plugin
    pub fn plugin(options: MathOptions) -> PluginDescriptor {
        let declared = serde_json::to_value(&options).unwrap_or(Value::Null);
        PluginDescriptor::new(Self::NAMESPACE, |relay, options, done| async move {
            let options: MathOptions = match serde_json::from_value(options) {
                Ok(options) => options,
                Err(err) => return done.fail(err),
            };
            match Self::install(relay, options).await {
                Ok(()) => done.ok(),
                Err(err) => done.fail(err),
            }
        })
        .with_options(declared)
    }

    async fn install(relay: Relay, options: MathOptions) -> Result<(), RelayError> {
        relay
            .add(json!({"topic": Self::NAMESPACE, "cmd": "add"}), |req| async move {
                arithmetic(&req, i64::checked_add, |a, b| a + b)
            })
            .await?;
        relay
            .add(json!({"topic": Self::NAMESPACE, "cmd": "sub"}), |req| async move {
                arithmetic(&req, i64::checked_sub, |a, b| a - b)
            })
            .await?;

        let max_count = options.max_count;
        relay
            .add_stream(json!({"topic": Self::NAMESPACE, "cmd": "count"}), move |req| {
                count(req, max_count)
            })
            .await?;
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> BusinessError {
    BusinessError::named("ValidationError", message).with_code("ERR_INVALID_ARGUMENT")
}

fn operand<'a>(req: &'a Request, key: &str) -> Result<&'a Value, BusinessError> {
    req.get(key)
        .filter(|value| value.is_number())
        .ok_or_else(|| invalid(format!("'{}' must be a number", key)))
}

/// Integer arithmetic when both operands are integers and it does not
/// overflow, floating point otherwise
fn arithmetic(
    req: &Request,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, BusinessError> {
    let a = operand(req, "a")?;
    let b = operand(req, "b")?;
    if let Some(result) = a.as_i64().zip(b.as_i64()).and_then(|(a, b)| int_op(a, b)) {
        return Ok(json!(result));
    }
    let a = a.as_f64().unwrap_or(f64::NAN);
    let b = b.as_f64().unwrap_or(f64::NAN);
    Ok(json!(float_op(a, b)))
}

fn count(req: Request, max_count: u64) -> impl Stream<Item = Result<Value, BusinessError>> {
    stream! {
        match req.get("to").and_then(Value::as_u64) {
            None => yield Err(invalid("'to' must be a non-negative integer")),
            Some(to) if to > max_count => {
                yield Err(invalid(format!("'to' may not exceed {}", max_count)));
            }
            Some(to) => {
                for n in 1..=to {
                    yield Ok(json!(n));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::transport::MemoryTransport;
    use futures::StreamExt;

    async fn relay(options: MathOptions) -> Relay {
        let relay = Relay::new(MemoryTransport::new(), RelayConfig::default());
        relay.use_plugin(Math::plugin(options));
        relay.ready().await.unwrap();
        relay
    }

    #[tokio::test]
    async fn test_add_and_sub() {
        let relay = relay(MathOptions::default()).await;
        let sum = relay
            .act(json!({"topic": "math", "cmd": "add", "a": 1, "b": 2}))
            .await
            .unwrap();
        assert_eq!(sum, json!(3));

        let diff = relay
            .act(json!({"topic": "math", "cmd": "sub", "a": 2.5, "b": 1}))
            .await
            .unwrap();
        assert_eq!(diff, json!(1.5));
    }

    #[tokio::test]
    async fn test_missing_operand_is_validation_error() {
        let relay = relay(MathOptions::default()).await;
        let err = relay
            .act(json!({"topic": "math", "cmd": "add", "a": 1}))
            .await
            .unwrap_err();
        let business = err.as_business().unwrap();
        assert_eq!(business.name, "ValidationError");
        assert_eq!(business.code.as_deref(), Some("ERR_INVALID_ARGUMENT"));
    }

    #[tokio::test]
    async fn test_count_streams_every_number() {
        let relay = relay(MathOptions::default()).await;
        let replies: Vec<Value> = relay
            .act_stream(json!({"topic": "math", "cmd": "count", "to": 5, "maxMessages$": 5}))
            .await
            .unwrap()
            .map(|reply| reply.unwrap())
            .collect()
            .await;
        assert_eq!(replies, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
    }

    #[tokio::test]
    async fn test_count_respects_option_limit() {
        let relay = relay(MathOptions { max_count: 3 }).await;
        let err = relay
            .act(json!({"topic": "math", "cmd": "count", "to": 4}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ERR_INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_bad_options_fail_boot() {
        let relay = Relay::new(MemoryTransport::new(), RelayConfig::default());
        let plugin =
            Math::plugin(MathOptions::default()).with_options(json!({"max_count": "lots"}));
        relay.use_plugin(plugin);
        let err = relay.ready().await.unwrap_err();
        assert_eq!(err.code(), "ERR_PLUGIN_FAILED");
        assert_eq!(err.plugin().unwrap().name, "math");
    }
}
