//! Server events
//!
//! Every step of uplink and downlink processing publishes an [`Event`] to
//! an [`EventSink`]. Events are observational: publishing never fails and
//! never blocks processing.

use std::fmt;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::device::EndDeviceIds;
use crate::device::FieldPath;
use crate::error::Error;
use crate::messages::{ApplicationUp, DownlinkMessage, JoinResponse, ScheduleDownlinkResponse};

/// Event name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    /// Data uplink observation received
    ReceiveDataUplink,
    /// Data uplink observation dropped
    DropDataUplink,
    /// Data uplink processed
    ProcessDataUplink,
    /// Data uplink forwarded to the Application Server
    ForwardDataUplink,
    /// Join-request observation received
    ReceiveJoinRequest,
    /// Join-request observation dropped
    DropJoinRequest,
    /// Join-request processed
    ProcessJoinRequest,
    /// Join-accept forwarded to the Application Server
    ForwardJoinAccept,
    /// Application Server did not take a message
    ForwardApplicationUpFail,
    /// Join-request sent to a cluster Join Server
    ClusterJoinAttempt,
    /// Cluster Join Server accepted the join-request
    ClusterJoinSuccess,
    /// Cluster Join Server rejected the join-request
    ClusterJoinFail,
    /// Join-request sent through interoperability
    InteropJoinAttempt,
    /// Interoperability Join Server accepted the join-request
    InteropJoinSuccess,
    /// Interoperability Join Server rejected the join-request
    InteropJoinFail,
    /// Join-accept handed to a Gateway Server
    ScheduleJoinAcceptAttempt,
    /// Join-accept scheduled
    ScheduleJoinAcceptSuccess,
    /// Join-accept could not be scheduled
    ScheduleJoinAcceptFail,
    /// Data downlink handed to a Gateway Server
    ScheduleDataDownlinkAttempt,
    /// Data downlink scheduled
    ScheduleDataDownlinkSuccess,
    /// Data downlink could not be scheduled
    ScheduleDataDownlinkFail,
    /// Gateway transmitted a downlink
    TransmissionSuccess,
    /// Gateway failed to transmit a downlink
    TransmissionFail,
    /// Device created
    CreateEndDevice,
    /// Device updated
    UpdateEndDevice,
}

impl EventName {
    /// Stable event name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::ReceiveDataUplink => "ns.up.data.receive",
            EventName::DropDataUplink => "ns.up.data.drop",
            EventName::ProcessDataUplink => "ns.up.data.process",
            EventName::ForwardDataUplink => "ns.up.data.forward",
            EventName::ReceiveJoinRequest => "ns.up.join.receive",
            EventName::DropJoinRequest => "ns.up.join.drop",
            EventName::ProcessJoinRequest => "ns.up.join.process",
            EventName::ForwardJoinAccept => "ns.up.join.accept.forward",
            EventName::ForwardApplicationUpFail => "ns.up.forward.fail",
            EventName::ClusterJoinAttempt => "ns.up.join.cluster.attempt",
            EventName::ClusterJoinSuccess => "ns.up.join.cluster.success",
            EventName::ClusterJoinFail => "ns.up.join.cluster.fail",
            EventName::InteropJoinAttempt => "ns.up.join.interop.attempt",
            EventName::InteropJoinSuccess => "ns.up.join.interop.success",
            EventName::InteropJoinFail => "ns.up.join.interop.fail",
            EventName::ScheduleJoinAcceptAttempt => "ns.down.join.schedule.attempt",
            EventName::ScheduleJoinAcceptSuccess => "ns.down.join.schedule.success",
            EventName::ScheduleJoinAcceptFail => "ns.down.join.schedule.fail",
            EventName::ScheduleDataDownlinkAttempt => "ns.down.data.schedule.attempt",
            EventName::ScheduleDataDownlinkSuccess => "ns.down.data.schedule.success",
            EventName::ScheduleDataDownlinkFail => "ns.down.data.schedule.fail",
            EventName::TransmissionSuccess => "ns.down.transmission.success",
            EventName::TransmissionFail => "ns.down.transmission.fail",
            EventName::CreateEndDevice => "ns.end_device.create",
            EventName::UpdateEndDevice => "ns.end_device.update",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payload
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    /// No payload
    None,
    /// Failure
    Error(Error),
    /// Downlink being scheduled
    Downlink(Box<DownlinkMessage>),
    /// Gateway Server answer
    ScheduleResponse(ScheduleDownlinkResponse),
    /// Join Server answer, without session keys
    JoinResponse(Box<JoinResponse>),
    /// Message forwarded to the Application Server
    ApplicationUp(Box<ApplicationUp>),
    /// Fields written to the registry
    FieldPaths(Vec<FieldPath>),
}

/// Server event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Name
    pub name: EventName,
    /// Device the event concerns, when known
    pub identifiers: Option<EndDeviceIds>,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
    /// Payload
    pub data: EventData,
    /// When the event was raised
    pub time: SystemTime,
}

impl Event {
    /// New event without payload
    pub fn new(name: EventName, identifiers: Option<&EndDeviceIds>, correlation_ids: &[String]) -> Self {
        Self {
            name,
            identifiers: identifiers.cloned(),
            correlation_ids: correlation_ids.to_vec(),
            data: EventData::None,
            time: SystemTime::now(),
        }
    }

    /// Attach a payload
    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = data;
        self
    }

    /// Attach an error
    pub fn with_error(self, err: Error) -> Self {
        self.with_data(EventData::Error(err))
    }

    /// Error payload, if any
    pub fn error(&self) -> Option<&Error> {
        match &self.data {
            EventData::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// Event publisher
pub trait EventSink: Send + Sync {
    /// Publish an event
    fn publish(&self, event: Event);
}

/// Sink logging every event at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: Event) {
        debug!(
            name = event.name.as_str(),
            device = ?event.identifiers.as_ref().map(|ids| ids.key()),
            error = ?event.error(),
            "Event"
        );
    }
}

/// Sink forwarding events to a channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelEventSink {
    /// New sink and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: Event) {
        // A closed receiver only means nobody listens anymore.
        let _ = self.tx.send(event);
    }
}
