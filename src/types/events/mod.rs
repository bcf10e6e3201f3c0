// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire-compatible event content types.
//!
//! Every polymorphic payload is modeled as an enum over the known content
//! kinds, selected by the `algorithm` or `type` label, with an explicit
//! `Unknown` fallback variant that keeps the raw data around.

pub mod encrypted;
pub mod forwarded_room_key;
pub mod olm_v1;
pub mod room_key;
pub mod room_key_request;

use std::collections::BTreeMap;

use ruma_common::OwnedUserId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::EventEncryptionAlgorithm;

/// A to-device event as received from the sync endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceEvent<C> {
    /// The user that sent us the event.
    pub sender: OwnedUserId,
    /// The body of the event.
    pub content: C,
}

impl<C> ToDeviceEvent<C> {
    /// Create a new to-device event.
    pub fn new(sender: OwnedUserId, content: C) -> Self {
        Self { sender, content }
    }
}

/// An event content of a kind or algorithm this crate doesn't understand.
///
/// The raw fields are kept so the content survives a serialization cycle
/// unchanged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnknownContent {
    /// The algorithm the content declared.
    pub algorithm: EventEncryptionAlgorithm,
    /// The remaining fields of the content.
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// A deserialisation helper splitting the algorithm label off the remaining
/// content fields.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AlgorithmHelper {
    pub algorithm: EventEncryptionAlgorithm,
    #[serde(flatten)]
    pub other: Value,
}

/// Generate the label-based serialization glue for an enum over per-algorithm
/// content types with an `Unknown` fallback.
macro_rules! algorithm_serialization {
    ($something:ident, $($algorithm:ident => $content:ty),+ $(,)?) => {
        $(
            impl From<$content> for $something {
                fn from(c: $content) -> Self {
                    Self::$algorithm(c)
                }
            }
        )+

        impl $something {
            /// The algorithm of this content.
            pub fn algorithm(&self) -> $crate::types::EventEncryptionAlgorithm {
                match self {
                    $(
                        Self::$algorithm(_) =>
                            $crate::types::EventEncryptionAlgorithm::$algorithm,
                    )+
                    Self::Unknown(c) => c.algorithm.to_owned(),
                }
            }
        }

        impl TryFrom<$crate::types::events::AlgorithmHelper> for $something {
            type Error = serde_json::Error;

            fn try_from(
                value: $crate::types::events::AlgorithmHelper,
            ) -> Result<Self, Self::Error> {
                Ok(match value.algorithm {
                    $(
                        $crate::types::EventEncryptionAlgorithm::$algorithm => {
                            let content: $content = serde_json::from_value(value.other)?;
                            content.into()
                        }
                    )+
                    _ => Self::Unknown($crate::types::events::UnknownContent {
                        algorithm: value.algorithm,
                        other: serde_json::from_value(value.other)?,
                    }),
                })
            }
        }

        impl serde::Serialize for $something {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                let helper = match self {
                    $(
                        Self::$algorithm(r) => $crate::types::events::AlgorithmHelper {
                            algorithm: self.algorithm(),
                            other: serde_json::to_value(r)
                                .map_err(serde::ser::Error::custom)?,
                        },
                    )+
                    Self::Unknown(r) => $crate::types::events::AlgorithmHelper {
                        algorithm: r.algorithm.to_owned(),
                        other: serde_json::to_value(r.other.to_owned())
                            .map_err(serde::ser::Error::custom)?,
                    },
                };

                helper.serialize(serializer)
            }
        }
    };
}

pub(crate) use algorithm_serialization;
