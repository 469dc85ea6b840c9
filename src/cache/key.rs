use crate::value::Value;

/// Identifies the pooled connection a [`StatementKey`] belongs to. Spec §3
/// calls for "reference identity" of the connection; rather than keying off
/// a raw pointer (which would tie the cache to `unsafe` lifetime reasoning),
/// `sqlpool` assigns each [`crate::pool::PooledHandle`] a monotonically
/// increasing id at creation time and uses that as the stable identity.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ConnectionId(pub(crate) u64);

/// Which prepare method (and overload arity) produced a cached statement.
/// Spec §9 calls for replacing reflection-based method identity with "a
/// cheap enum `{PrepareStatement0, PrepareStatement1, PrepareCall0, ...}`
/// matching the overload set" — `arity` plays that role generically instead
/// of enumerating every call shape by hand.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MethodIdentity {
    PrepareStatement { arity: u8 },
    PrepareCall { arity: u8 },
}

/// The key under which a prepared/callable statement is cached: the owning
/// connection's identity, which method (and overload) produced it, and the
/// immutable argument sequence it was prepared with (spec §3).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct StatementKey {
    pub connection_id: ConnectionId,
    pub method: MethodIdentity,
    pub args: Vec<Value>,
}

impl StatementKey {
    pub fn new(connection_id: ConnectionId, method: MethodIdentity, args: Vec<Value>) -> Self {
        StatementKey {
            connection_id,
            method,
            args,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_with_same_fields_are_equal() {
        let a = StatementKey::new(
            ConnectionId(1),
            MethodIdentity::PrepareStatement { arity: 0 },
            vec![Value::I64(7)],
        );
        let b = StatementKey::new(
            ConnectionId(1),
            MethodIdentity::PrepareStatement { arity: 0 },
            vec![Value::I64(7)],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn different_connection_identity_differs() {
        let a = StatementKey::new(
            ConnectionId(1),
            MethodIdentity::PrepareStatement { arity: 0 },
            vec![],
        );
        let b = StatementKey::new(
            ConnectionId(2),
            MethodIdentity::PrepareStatement { arity: 0 },
            vec![],
        );
        assert_ne!(a, b);
    }

    #[test]
    fn prepare_statement_and_prepare_call_are_distinct() {
        let a = StatementKey::new(
            ConnectionId(1),
            MethodIdentity::PrepareStatement { arity: 0 },
            vec![],
        );
        let b = StatementKey::new(
            ConnectionId(1),
            MethodIdentity::PrepareCall { arity: 0 },
            vec![],
        );
        assert_ne!(a, b);
    }
}
