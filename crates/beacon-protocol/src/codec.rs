//! Packet codec for the beacon wire grammar.
//!
//! Wire format: `<app tag:2><kind tag:2>|f1|f2|...|fn`.
//!
//! Two grammars, told apart by their app tag:
//!   - Anchored (`PM`): variable-width fields parsed from the END. The last
//!     fields are short fixed-meaning tokens; everything before them is the
//!     leading free-text field, delimiters included.
//!   - Fixed (`PF`): every field padded to a fixed width and read by char
//!     position. Text pads right with spaces, numeric codes pad left with `0`.
//!
//! Builders never fail: oversized input is truncated to the field width.

use serde::{Deserialize, Serialize};

use crate::packets::{ConnectionCall, ConnectionMessage, Discovery, EventAttendant, EventHost, Packet};
use crate::{
    ACTION_LEN, DELIMITER, EVENT_ID_MAX, ID_LEN, KIND_CONNECTION_CALL, KIND_DISCOVERY,
    KIND_EVENT_ATTENDANT, KIND_EVENT_HOST, NAME_MAX,
};

/// Grammar version. Not bit-compatible with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grammar {
    #[default]
    Anchored,
    Fixed,
}

impl Grammar {
    pub const fn app_tag(self) -> &'static str {
        match self {
            Grammar::Anchored => "PM",
            Grammar::Fixed => "PF",
        }
    }

    /// Discovery bio width.
    pub const fn bio_max(self) -> usize {
        match self {
            Grammar::Anchored => 11,
            Grammar::Fixed => 8,
        }
    }

    /// Connection message width (word vs. numeric code).
    pub const fn message_width(self) -> usize {
        match self {
            Grammar::Anchored => 8,
            Grammar::Fixed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Pad {
    /// Free text and IDs: spaces on the right.
    Text,
    /// Numeric codes: zeros on the left.
    Numeric,
}

struct Field<'a> {
    value: &'a str,
    width: usize,
    pad: Pad,
}

impl<'a> Field<'a> {
    fn text(value: &'a str, width: usize) -> Self {
        Self {
            value,
            width,
            pad: Pad::Text,
        }
    }

    fn numeric(value: &'a str, width: usize) -> Self {
        Self {
            value,
            width,
            pad: Pad::Numeric,
        }
    }
}

/// Stateless parser/builder for one grammar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketCodec {
    grammar: Grammar,
}

impl PacketCodec {
    pub const fn new(grammar: Grammar) -> Self {
        Self { grammar }
    }

    pub fn grammar(&self) -> Grammar {
        self.grammar
    }

    // ========================================================================
    // Parse
    // ========================================================================

    /// Parse a raw beacon. Anything mistagged or malformed comes back as
    /// `Packet::Unknown`; callers drop those silently.
    pub fn parse(&self, raw: &str) -> Packet {
        let prefix_tag: String = raw.chars().take(2).collect();
        let type_tag: String = raw.chars().skip(2).take(2).collect();

        let parsed = if prefix_tag == self.grammar.app_tag() {
            let rest: String = raw.chars().skip(4).collect();
            rest.strip_prefix(DELIMITER)
                .and_then(|body| self.parse_body(&type_tag, body))
        } else {
            None
        };

        parsed.unwrap_or_else(|| {
            tracing::trace!(prefix = %prefix_tag, kind = %type_tag, len = raw.len(), "codec: unparseable packet");
            Packet::Unknown {
                prefix_tag,
                type_tag,
            }
        })
    }

    fn parse_body(&self, kind: &str, body: &str) -> Option<Packet> {
        match kind {
            KIND_DISCOVERY => self.parse_discovery(body).map(Packet::Discovery),
            KIND_CONNECTION_CALL => self.parse_connection_call(body).map(Packet::ConnectionCall),
            KIND_EVENT_HOST => self.parse_event_host(body).map(Packet::EventHost),
            KIND_EVENT_ATTENDANT => self.parse_event_attendant(body).map(Packet::EventAttendant),
            _ => None,
        }
    }

    fn parse_discovery(&self, body: &str) -> Option<Discovery> {
        let [name, bio, id] = self.split::<3>(body, [NAME_MAX, self.grammar.bio_max(), ID_LEN])?;
        let id_len = id.chars().count();
        if id_len == 0 || id_len > ID_LEN {
            return None;
        }
        Some(Discovery { name, bio, id })
    }

    fn parse_connection_call(&self, body: &str) -> Option<ConnectionCall> {
        let [from_name, from_id, to_id, message] = self.split::<4>(
            body,
            [NAME_MAX, ID_LEN, ID_LEN, self.grammar.message_width()],
        )?;
        if from_id.chars().count() != ID_LEN || to_id.chars().count() != ID_LEN {
            return None;
        }
        Some(ConnectionCall {
            from_name,
            from_id,
            to_id,
            message: ConnectionMessage::from_wire(&message, self.grammar),
        })
    }

    fn parse_event_host(&self, body: &str) -> Option<EventHost> {
        let [event_id, host_id, action] = self.parse_event_fields(body)?;
        Some(EventHost {
            event_id,
            host_id,
            action,
        })
    }

    fn parse_event_attendant(&self, body: &str) -> Option<EventAttendant> {
        let [event_id, guest_id, ack] = self.parse_event_fields(body)?;
        Some(EventAttendant {
            event_id,
            guest_id,
            ack,
        })
    }

    /// `eventID | peerID | code`, shared by host and attendant packets.
    fn parse_event_fields(&self, body: &str) -> Option<[String; 3]> {
        let fields = self.split::<3>(body, [EVENT_ID_MAX, ID_LEN, ACTION_LEN])?;
        let event_len = fields[0].chars().count();
        if event_len == 0 || event_len > EVENT_ID_MAX {
            return None;
        }
        if fields[1].chars().count() != ID_LEN || fields[2].is_empty() {
            return None;
        }
        Some(fields)
    }

    fn split<const N: usize>(&self, body: &str, widths: [usize; N]) -> Option<[String; N]> {
        let fields = match self.grammar {
            Grammar::Anchored => split_anchored(body, N)?,
            Grammar::Fixed => split_fixed(body, &widths)?,
        };
        fields.try_into().ok()
    }

    // ========================================================================
    // Build
    // ========================================================================

    pub fn build_discovery(&self, name: &str, bio: &str, id: &str) -> String {
        self.assemble(
            KIND_DISCOVERY,
            &[
                Field::text(name, NAME_MAX),
                Field::text(bio, self.grammar.bio_max()),
                Field::text(id, ID_LEN),
            ],
        )
    }

    pub fn build_connection_call(
        &self,
        from_name: &str,
        from_id: &str,
        to_id: &str,
        message: &ConnectionMessage,
    ) -> String {
        let wire = message.to_wire(self.grammar);
        self.assemble(
            KIND_CONNECTION_CALL,
            &[
                Field::text(from_name, NAME_MAX),
                Field::text(from_id, ID_LEN),
                Field::text(to_id, ID_LEN),
                Field::numeric(&wire, self.grammar.message_width()),
            ],
        )
    }

    pub fn build_event_host(&self, event_id: &str, host_id: &str, action: &str) -> String {
        self.assemble(
            KIND_EVENT_HOST,
            &[
                Field::text(event_id, EVENT_ID_MAX),
                Field::text(host_id, ID_LEN),
                Field::text(action, ACTION_LEN),
            ],
        )
    }

    pub fn build_event_attendant(&self, event_id: &str, guest_id: &str, ack: &str) -> String {
        self.assemble(
            KIND_EVENT_ATTENDANT,
            &[
                Field::text(event_id, EVENT_ID_MAX),
                Field::text(guest_id, ID_LEN),
                Field::text(ack, ACTION_LEN),
            ],
        )
    }

    /// Re-encode a parsed packet. `Unknown` has no wire form.
    pub fn build(&self, packet: &Packet) -> Option<String> {
        match packet {
            Packet::Discovery(d) => Some(self.build_discovery(&d.name, &d.bio, &d.id)),
            Packet::ConnectionCall(c) => Some(self.build_connection_call(
                &c.from_name,
                &c.from_id,
                &c.to_id,
                &c.message,
            )),
            Packet::EventHost(e) => Some(self.build_event_host(&e.event_id, &e.host_id, &e.action)),
            Packet::EventAttendant(e) => {
                Some(self.build_event_attendant(&e.event_id, &e.guest_id, &e.ack))
            }
            Packet::Unknown { .. } => None,
        }
    }

    fn assemble(&self, kind: &str, fields: &[Field<'_>]) -> String {
        let mut out = String::with_capacity(crate::MAX_PACKET_CHARS);
        out.push_str(self.grammar.app_tag());
        out.push_str(kind);

        for (index, field) in fields.iter().enumerate() {
            // Only the leading field may carry the delimiter.
            let cleaned: String = if index == 0 {
                field.value.to_string()
            } else {
                field.value.chars().filter(|c| *c != DELIMITER).collect()
            };
            let truncated: String = cleaned.chars().take(field.width).collect();

            out.push(DELIMITER);
            match (self.grammar, field.pad) {
                (Grammar::Anchored, _) => out.push_str(&truncated),
                (Grammar::Fixed, Pad::Text) => {
                    out.push_str(&format!("{truncated:<width$}", width = field.width))
                }
                (Grammar::Fixed, Pad::Numeric) => {
                    out.push_str(&format!("{truncated:0>width$}", width = field.width))
                }
            }
        }
        out
    }
}

/// Split `count` fields anchored from the end; the head keeps any delimiters.
fn split_anchored(body: &str, count: usize) -> Option<Vec<String>> {
    let mut parts: Vec<&str> = body.rsplitn(count, DELIMITER).collect();
    if parts.len() != count {
        return None;
    }
    parts.reverse();
    Some(parts.into_iter().map(str::to_string).collect())
}

/// Split fixed-width fields by char position and strip the padding.
fn split_fixed(body: &str, widths: &[usize]) -> Option<Vec<String>> {
    let chars: Vec<char> = body.chars().collect();
    let expected = widths.iter().sum::<usize>() + widths.len().saturating_sub(1);
    if chars.len() != expected {
        return None;
    }

    let mut fields = Vec::with_capacity(widths.len());
    let mut pos = 0;
    for (index, width) in widths.iter().enumerate() {
        if index > 0 {
            if chars[pos] != DELIMITER {
                return None;
            }
            pos += 1;
        }
        let raw: String = chars[pos..pos + width].iter().collect();
        fields.push(raw.trim_end_matches(' ').to_string());
        pos += width;
    }
    Some(fields)
}
