//! Control-channel wire protocol: the request / reply / telemetry codes and
//! the multi-part message framing consumed by the runner process. The first
//! part of every message is the 4-byte code; data parts follow in declared
//! order as null-terminated strings, raw bools, or raw ints.

/// Requests sent to the composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlRequest {
    /// (timeoutInSeconds: int, isBeingReplaced: bool)
    CompositionStop = 0,
    CompositionPause,
    CompositionUnpause,
    /// (portIdentifier: string, value: string)
    InputPortValueModify,
    /// (portIdentifier: string)
    InputPortValueRetrieve,
    /// (shouldUseInterprocessSerialization: bool, portIdentifier: string)
    OutputPortValueRetrieve,
    /// (portIdentifier: string)
    InputPortSummaryRetrieve,
    /// (portIdentifier: string)
    OutputPortSummaryRetrieve,
    /// (portIdentifier: string)
    TriggerPortFireEvent,
    PublishedInputPortNamesRetrieve,
    PublishedInputPortTypesRetrieve,
    PublishedInputPortDetailsRetrieve,
    PublishedOutputPortNamesRetrieve,
    PublishedOutputPortTypesRetrieve,
    PublishedOutputPortDetailsRetrieve,
    /// (names: string...)
    PublishedInputPortFireEvent,
    /// (name: string, value: string)
    PublishedInputPortValueModify,
    /// (name: string)
    PublishedInputPortValueRetrieve,
    /// (shouldUseInterprocessSerialization: bool, name: string)
    PublishedOutputPortValueRetrieve,
    SlowHeartbeat,
    /// (portIdentifier: string)
    InputPortTelemetrySubscribe,
    InputPortTelemetryUnsubscribe,
    OutputPortTelemetrySubscribe,
    OutputPortTelemetryUnsubscribe,
    EventTelemetrySubscribe,
    EventTelemetryUnsubscribe,
    AllTelemetrySubscribe,
    AllTelemetryUnsubscribe,
}

/// Replies mirroring each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlReply {
    CompositionStopping = 0,
    CompositionPaused,
    CompositionUnpaused,
    InputPortValueModified,
    InputPortValueRetrieved,
    OutputPortValueRetrieved,
    InputPortSummaryRetrieved,
    OutputPortSummaryRetrieved,
    TriggerPortFiredEvent,
    PublishedInputPortNamesRetrieved,
    PublishedInputPortTypesRetrieved,
    PublishedInputPortDetailsRetrieved,
    PublishedOutputPortNamesRetrieved,
    PublishedOutputPortTypesRetrieved,
    PublishedOutputPortDetailsRetrieved,
    PublishedInputPortFiredEvent,
    PublishedInputPortValueModified,
    PublishedInputPortValueRetrieved,
    PublishedOutputPortValueRetrieved,
    SlowHeartbeatReceived,
    InputPortTelemetrySubscribed,
    InputPortTelemetryUnsubscribed,
    OutputPortTelemetrySubscribed,
    OutputPortTelemetryUnsubscribed,
    EventTelemetrySubscribed,
    EventTelemetryUnsubscribed,
    AllTelemetrySubscribed,
    AllTelemetryUnsubscribed,
}

/// Telemetry streamed to subscribed listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TelemetryCode {
    /// Periodic statistics.
    Stats = 0,
    /// (compositionIdentifier: string, nodeIdentifier: string)
    NodeExecutionStarted,
    NodeExecutionFinished,
    /// Per-port records follow.
    InputPortsUpdated,
    OutputPortsUpdated,
    PublishedOutputPortsUpdated,
    /// (portIdentifier: string)
    EventDropped,
    /// (eventId: int)
    EventFinished,
    /// (message: string)
    Error,
    StopRequested,
}

impl ControlRequest {
    pub fn from_code(code: u32) -> Option<Self> {
        use ControlRequest::*;
        const ALL: &[ControlRequest] = &[
            CompositionStop,
            CompositionPause,
            CompositionUnpause,
            InputPortValueModify,
            InputPortValueRetrieve,
            OutputPortValueRetrieve,
            InputPortSummaryRetrieve,
            OutputPortSummaryRetrieve,
            TriggerPortFireEvent,
            PublishedInputPortNamesRetrieve,
            PublishedInputPortTypesRetrieve,
            PublishedInputPortDetailsRetrieve,
            PublishedOutputPortNamesRetrieve,
            PublishedOutputPortTypesRetrieve,
            PublishedOutputPortDetailsRetrieve,
            PublishedInputPortFireEvent,
            PublishedInputPortValueModify,
            PublishedInputPortValueRetrieve,
            PublishedOutputPortValueRetrieve,
            SlowHeartbeat,
            InputPortTelemetrySubscribe,
            InputPortTelemetryUnsubscribe,
            OutputPortTelemetrySubscribe,
            OutputPortTelemetryUnsubscribe,
            EventTelemetrySubscribe,
            EventTelemetryUnsubscribe,
            AllTelemetrySubscribe,
            AllTelemetryUnsubscribe,
        ];
        ALL.get(code as usize).copied()
    }
}

/// A multi-part message: the code part followed by data parts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    parts: Vec<Vec<u8>>,
}

impl Message {
    fn with_code(code: u32) -> Self {
        Message { parts: vec![code.to_le_bytes().to_vec()] }
    }

    pub fn request(code: ControlRequest) -> Self {
        Message::with_code(code as u32)
    }

    pub fn reply(code: ControlReply) -> Self {
        Message::with_code(code as u32)
    }

    pub fn telemetry(code: TelemetryCode) -> Self {
        Message::with_code(code as u32)
    }

    pub fn code(&self) -> Option<u32> {
        let part = self.parts.first()?;
        Some(u32::from_le_bytes(part.get(0..4)?.try_into().ok()?))
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Append a null-terminated string part.
    pub fn add_string(&mut self, value: &str) -> &mut Self {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.parts.push(bytes);
        self
    }

    pub fn add_bool(&mut self, value: bool) -> &mut Self {
        self.parts.push(vec![value as u8]);
        self
    }

    pub fn add_int(&mut self, value: i32) -> &mut Self {
        self.parts.push(value.to_le_bytes().to_vec());
        self
    }

    /// The string in data part `index` (0 = first part after the code).
    pub fn string_at(&self, index: usize) -> Option<String> {
        let part = self.parts.get(index + 1)?;
        let end = part.iter().position(|b| *b == 0).unwrap_or(part.len());
        String::from_utf8(part[..end].to_vec()).ok()
    }

    pub fn bool_at(&self, index: usize) -> Option<bool> {
        self.parts.get(index + 1).and_then(|p| p.first()).map(|b| *b != 0)
    }

    pub fn int_at(&self, index: usize) -> Option<i32> {
        let part = self.parts.get(index + 1)?;
        Some(i32::from_le_bytes(part.get(0..4)?.try_into().ok()?))
    }

    /// Flatten into length-prefixed wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for part in &self.parts {
            out.extend_from_slice(&(part.len() as u32).to_le_bytes());
            out.extend_from_slice(part);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut parts = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let len =
                u32::from_le_bytes(bytes.get(offset..offset + 4)?.try_into().ok()?) as usize;
            offset += 4;
            parts.push(bytes.get(offset..offset + len)?.to_vec());
            offset += len;
        }
        Some(Message { parts })
    }
}

/// One port's record within a ports-updated telemetry message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortUpdate {
    pub port_identifier: String,
    pub saw_event: bool,
    pub saw_data: bool,
    pub summary: String,
}

impl PortUpdate {
    pub fn append_to(&self, message: &mut Message) {
        message
            .add_string(&self.port_identifier)
            .add_bool(self.saw_event)
            .add_bool(self.saw_data)
            .add_string(&self.summary);
    }

    /// Read the record starting at data part `index`; returns the record
    /// and the index just past it.
    pub fn read_from(message: &Message, index: usize) -> Option<(PortUpdate, usize)> {
        Some((
            PortUpdate {
                port_identifier: message.string_at(index)?,
                saw_event: message.bool_at(index + 1)?,
                saw_data: message.bool_at(index + 2)?,
                summary: message.string_at(index + 3)?,
            },
            index + 4,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes_are_dense() {
        assert_eq!(ControlRequest::from_code(0), Some(ControlRequest::CompositionStop));
        assert_eq!(
            ControlRequest::from_code(ControlRequest::AllTelemetryUnsubscribe as u32),
            Some(ControlRequest::AllTelemetryUnsubscribe)
        );
        assert_eq!(ControlRequest::from_code(999), None);
    }

    #[test]
    fn stop_request_roundtrips() {
        let mut message = Message::request(ControlRequest::CompositionStop);
        message.add_int(5).add_bool(true);
        let decoded = Message::from_bytes(&message.to_bytes()).expect("decode");
        assert_eq!(decoded.code(), Some(ControlRequest::CompositionStop as u32));
        assert_eq!(decoded.int_at(0), Some(5));
        assert_eq!(decoded.bool_at(1), Some(true));
    }

    #[test]
    fn port_update_records_chain() {
        let mut message = Message::telemetry(TelemetryCode::InputPortsUpdated);
        let first = PortUpdate {
            port_identifier: "Count__increment".into(),
            saw_event: true,
            saw_data: true,
            summary: "7".into(),
        };
        let second = PortUpdate {
            port_identifier: "Count__decrement".into(),
            saw_event: true,
            saw_data: false,
            summary: String::new(),
        };
        first.append_to(&mut message);
        second.append_to(&mut message);

        let (read_first, next) = PortUpdate::read_from(&message, 0).expect("first");
        let (read_second, _) = PortUpdate::read_from(&message, next).expect("second");
        assert_eq!(read_first, first);
        assert_eq!(read_second, second);
    }
}
