//! Outgoing notifications: target resolution and argument filling.

use crate::catalog::SignalCatalog;
use crate::error::SignalError;
use crate::names::NameMapper;
use crate::types::{SignalKey, SignalMetadata, UserInfo, Value, positional_key};
use log::debug;

/// What an outgoing notification is emitted as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PostTarget {
    /// Notification name, resolved through the name mapper.
    Name(String),
    Signal { member: String, interface: String },
}

impl PostTarget {
    pub fn resolve(
        &self,
        names: &NameMapper,
        catalog: &SignalCatalog,
    ) -> Result<SignalKey, SignalError> {
        match self {
            PostTarget::Name(name) => names.resolve(name, catalog),
            PostTarget::Signal { member, interface } => {
                Ok(SignalKey::new(interface.clone(), member.clone()))
            }
        }
    }
}

/// Look up the declared signal for `key`.
pub fn declared_signal<'a>(
    catalog: &'a SignalCatalog,
    key: &SignalKey,
) -> Result<&'a SignalMetadata, SignalError> {
    catalog
        .get(&key.interface, &key.member)
        .ok_or_else(|| SignalError::UnknownSignal {
            interface: key.interface.clone(),
            member: key.member.clone(),
        })
}

/// Ordered argument list for `signal` taken from `payload`.
///
/// Each argument is looked up by its key annotation, then by "argN".
/// Missing basic arguments get their zero value; a missing composite
/// argument or a supplied value of the wrong type fails the whole post.
pub fn fill_arguments(
    signal: &SignalMetadata,
    payload: &UserInfo,
) -> Result<Vec<Value>, SignalError> {
    signal
        .args
        .iter()
        .enumerate()
        .map(|(index, arg)| {
            let positional = positional_key(index);
            let found = arg
                .key
                .as_ref()
                .and_then(|key| payload.get(key))
                .or_else(|| payload.get(&positional));

            if let Some(value) = found {
                if !value.fits(&arg.signature) {
                    return Err(SignalError::ArgumentTypeMismatch {
                        index,
                        key: arg.payload_key(index),
                        signature: arg.signature.clone(),
                    });
                }
                return Ok(value.clone());
            }

            match arg.kind().zero_value() {
                Some(zero) => {
                    debug!(
                        "{}.{}: argument {} missing, using {:?}",
                        signal.interface, signal.member, index, zero
                    );
                    Ok(zero)
                }
                None => Err(SignalError::MissingRequiredArgument {
                    index,
                    key: arg.payload_key(index),
                    signature: arg.signature.clone(),
                }),
            }
        })
        .collect()
}
