// Copyright (C) 2022 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Error reported by a [`Serializer`] while encoding or decoding one item.
#[derive(Error, Debug)]
#[error("{msg}")]
pub struct SerializationError {
    msg: String,
}

impl SerializationError {
    pub fn new(msg: impl fmt::Display) -> SerializationError {
        SerializationError {
            msg: msg.to_string(),
        }
    }
}

/// Translates queue items to and from byte strings.
///
/// The `version` tag is recorded in the queue metadata when a directory is
/// first initialized and compared on every reopen. Opening an existing queue
/// with a serializer reporting a different version fails with
/// [`QueueError::ConfigMismatch`](crate::QueueError::ConfigMismatch): records
/// written in one format are never fed to a decoder of another.
pub trait Serializer: Send + 'static {
    type Item;

    /// Identifies the wire format produced by this serializer.
    fn version(&self) -> &'static str;

    fn encode(&self, item: &Self::Item) -> Result<Vec<u8>, SerializationError>;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Item, SerializationError>;
}

/// Serializes items as JSON documents.
pub struct JsonSerializer<T> {
    _item: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> JsonSerializer<T> {
        JsonSerializer { _item: PhantomData }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> JsonSerializer<T> {
        JsonSerializer::new()
    }
}

impl<T> Serializer for JsonSerializer<T>
where T: Serialize + DeserializeOwned + 'static
{
    type Item = T;

    fn version(&self) -> &'static str {
        "json.1"
    }

    fn encode(&self, item: &T) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(item).map_err(SerializationError::new)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        serde_json::from_slice(bytes).map_err(SerializationError::new)
    }
}

/// Hands raw byte payloads through untouched.
pub struct BytesSerializer;

impl Serializer for BytesSerializer {
    type Item = Vec<u8>;

    fn version(&self) -> &'static str {
        "bytes.1"
    }

    fn encode(&self, item: &Vec<u8>) -> Result<Vec<u8>, SerializationError> {
        Ok(item.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, SerializationError> {
        Ok(bytes.to_vec())
    }
}
