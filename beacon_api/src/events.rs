//! Parser for the `text/event-stream` responses of `/eth/v1/events`.

use core::str;

use bytes::Bytes;
use futures::{
    future,
    stream::{self, Stream, StreamExt as _},
};
use log::debug;
use serde::de::DeserializeOwned;
use strum::{EnumString, IntoStaticStr};
use types::containers::NodeEvent;

use crate::{
    node::NodeError,
    raw::{RawChainReorgEvent, RawFinalizedCheckpointEvent, RawHeadEvent},
};

pub const RESOURCE: &str = "events";

/// Limit on the bytes buffered for a single event, including its unterminated last line.
pub const MAX_EVENT_SIZE: usize = 1 << 20;

#[derive(Clone, Copy, PartialEq, Eq, Debug, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Topic {
    Head,
    FinalizedCheckpoint,
    ChainReorg,
}

impl Topic {
    pub const SUBSCRIBED: [Self; 3] = [Self::Head, Self::FinalizedCheckpoint, Self::ChainReorg];

    #[must_use]
    pub fn query() -> String {
        Self::SUBSCRIBED.map(<&str>::from).join(",")
    }
}

/// Incremental server-sent events decoder.
///
/// Chunks may split lines and events at arbitrary byte offsets.
/// An event growing past [`MAX_EVENT_SIZE`] is reported as malformed once
/// and skipped up to the end of the line being received.
#[derive(Default)]
pub struct EventParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    discarding: bool,
}

impl EventParser {
    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<Result<NodeEvent, NodeError>> {
        let mut events = vec![];

        if self.discarding {
            let Some(position) = chunk.iter().position(|byte| *byte == b'\n') else {
                return events;
            };

            chunk = chunk.split_at(position + 1).1;
            self.discarding = false;
        }

        self.buffer.extend_from_slice(chunk);

        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=position).collect::<Vec<_>>();

            let line = match str::from_utf8(&line) {
                Ok(line) => line.trim_end_matches(['\n', '\r']),
                Err(error) => {
                    events.push(Err(NodeError::malformed(RESOURCE, error)));
                    continue;
                }
            };

            if line.is_empty() {
                events.extend(self.dispatch());
            } else if let Some(event) = line.strip_prefix("event:") {
                self.event = Some(event.trim_start().to_owned());
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data.push(data.trim_start().to_owned());
            }
        }

        let pending = self.buffer.len() + self.data.iter().map(String::len).sum::<usize>();

        if pending > MAX_EVENT_SIZE {
            events.push(Err(NodeError::malformed(
                RESOURCE,
                format_args!("event exceeds {MAX_EVENT_SIZE} bytes"),
            )));

            self.buffer.clear();
            self.event = None;
            self.data.clear();
            self.discarding = true;
        }

        events
    }

    fn dispatch(&mut self) -> Option<Result<NodeEvent, NodeError>> {
        let data = core::mem::take(&mut self.data).join("\n");
        let event = self.event.take()?;

        let Ok(topic) = event.parse() else {
            debug!("ignoring event with unsubscribed topic {event}");
            return None;
        };

        let event = match topic {
            Topic::Head => decode::<RawHeadEvent>(&data).map(|raw| NodeEvent::Head(raw.into())),
            Topic::FinalizedCheckpoint => decode::<RawFinalizedCheckpointEvent>(&data)
                .map(|raw| NodeEvent::FinalizedCheckpoint(raw.into())),
            Topic::ChainReorg => {
                decode::<RawChainReorgEvent>(&data).map(|raw| NodeEvent::ChainReorg(raw.into()))
            }
        };

        Some(event)
    }
}

fn decode<T: DeserializeOwned>(data: &str) -> Result<T, NodeError> {
    serde_json::from_str(data).map_err(|error| NodeError::malformed(RESOURCE, error))
}

pub fn parse_events<E>(
    chunks: impl Stream<Item = Result<Bytes, E>> + Send + 'static,
    map_error: impl Fn(E) -> NodeError + Send + 'static,
) -> impl Stream<Item = Result<NodeEvent, NodeError>> + Send + 'static {
    chunks
        .scan(EventParser::default(), move |parser, chunk| {
            let events = match chunk {
                Ok(chunk) => parser.push(&chunk),
                Err(error) => vec![Err(map_error(error))],
            };

            future::ready(Some(stream::iter(events)))
        })
        .flatten()
}
