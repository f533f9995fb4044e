//! Fragment tree for presenting a reassembled message.
//!
//! [`show_fragment_tree`] lists the fragments a message was built from, in
//! the bracketed summary style protocol analyzers use, flagging every
//! recorded anomaly next to the fragment it was detected on. The items carry
//! the frame and byte range each line refers to, so a front end can link them
//! back to packets; [`render`] turns them into indented text.

use std::{fmt::Write as _, ops::Range};

use crate::{
    fragment::{Anomalies, AnomalyKind, Discipline, FragmentSummary, Reassembled},
    key::FrameNumber,
};

/// Protocol-specific wording for a fragment tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeLabels<'a> {
    /// Protocol name, e.g. `IPv4`.
    pub protocol: &'a str,
    /// Plural noun for one piece, e.g. `Fragments` or `Segments`.
    pub unit: &'a str,
}

impl<'a> TreeLabels<'a> {
    /// Labels for `protocol` fragments.
    #[must_use]
    pub const fn new(protocol: &'a str) -> Self {
        Self {
            protocol,
            unit: "Fragments",
        }
    }

    /// Use `unit` instead of "Fragments".
    #[must_use]
    pub const fn with_unit(mut self, unit: &'a str) -> Self {
        self.unit = unit;
        self
    }
}

/// One line of a fragment tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeItem {
    /// Nesting level; the summary line is at depth zero.
    pub depth: usize,
    /// Display text.
    pub text: String,
    /// Packet the line refers to.
    pub frame: Option<FrameNumber>,
    /// Byte range of the reassembled payload the line covers.
    pub range: Option<Range<u32>>,
    /// Anomalies attached to the line.
    pub anomalies: Anomalies,
}

impl TreeItem {
    fn new(depth: usize, text: String) -> Self {
        Self {
            depth,
            text,
            frame: None,
            range: None,
            anomalies: Anomalies::NONE,
        }
    }
}

/// Build the fragment tree for `message`.
///
/// # Examples
///
/// ```
/// use std::net::Ipv4Addr;
///
/// use reassembly::{
///     FlowKey,
///     FragmentDescriptor,
///     FrameNumber,
///     KeyInput,
///     MessageId,
///     ReassemblyConfig,
///     ReassemblyTable,
///     tree::{TreeLabels, show_fragment_tree},
/// };
///
/// let mut table = ReassemblyTable::new("ipv4", ReassemblyConfig::default());
/// let flow = FlowKey::new(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST);
/// let key = KeyInput::new(&flow, MessageId::new(1));
/// table.add(&key, FragmentDescriptor::new(FrameNumber::new(1), 0, b"HELLO")).expect("accepted");
/// let message = table
///     .add(&key, FragmentDescriptor::new(FrameNumber::new(2), 5, b"WORLD").last())
///     .expect("accepted")
///     .expect("complete");
///
/// let items = show_fragment_tree(&message, &TreeLabels::new("IPv4"));
/// assert_eq!(items[0].text, "[2 IPv4 Fragments (10 bytes): #1(5), #2(5)]");
/// assert_eq!(items[1].text, "[Frame: 1, payload: 0-4 (5 bytes)]");
/// ```
#[must_use]
pub fn show_fragment_tree(message: &Reassembled, labels: &TreeLabels<'_>) -> Vec<TreeItem> {
    let fragments = message.fragments();
    let bytes = message.payload().len();
    let ranges = payload_ranges(message);

    let listing = fragments
        .iter()
        .map(|fragment| format!("#{}({})", fragment.frame, fragment.len))
        .collect::<Vec<_>>()
        .join(", ");
    let mut summary = TreeItem::new(
        0,
        format!(
            "[{} {} {} ({bytes} bytes): {listing}]",
            fragments.len(),
            labels.protocol,
            labels.unit
        ),
    );
    summary.anomalies = message.anomalies();
    summary.range = u32::try_from(bytes).ok().map(|end| 0..end);

    let mut items = vec![summary];
    for (fragment, range) in fragments.iter().zip(ranges) {
        items.push(fragment_item(fragment, range));
    }

    if !message.anomalies().is_empty() {
        let mut flagged = TreeItem::new(1, format!("[Message anomalies: {}]", message.anomalies()));
        flagged.anomalies = message.anomalies();
        items.push(flagged);
    }
    items.push(TreeItem::new(1, format!("[{} count: {}]", singular(labels.unit), fragments.len())));
    let mut completed = TreeItem::new(1, format!("[Reassembled in frame: {}]", message.reassembled_in()));
    completed.frame = Some(message.reassembled_in());
    items.push(completed);
    items.push(TreeItem::new(
        1,
        format!("[Reassembled {} length: {bytes}]", labels.protocol),
    ));
    items
}

/// Render items as indented text, one line per item.
#[must_use]
pub fn render(items: &[TreeItem]) -> String {
    let mut out = String::new();
    for item in items {
        let _ = writeln!(out, "{}{}", "    ".repeat(item.depth), item.text);
    }
    out
}

fn fragment_item(fragment: &FragmentSummary, range: Option<Range<u32>>) -> TreeItem {
    let mut text = format!("[Frame: {}, ", fragment.frame);
    match &range {
        Some(span) if !span.is_empty() => {
            let _ = write!(text, "payload: {}-{}", span.start, span.end - 1);
        }
        _ => text.push_str("payload: none"),
    }
    let _ = write!(text, " ({} bytes)]", fragment.len);
    for kind in fragment.anomalies.iter() {
        let _ = write!(text, "[{}]", describe(kind));
    }

    let mut item = TreeItem::new(1, text);
    item.frame = Some(fragment.frame);
    item.range = range;
    item.anomalies = fragment.anomalies;
    item
}

/// Byte range each fragment occupies in the payload.
///
/// Block fragments that did not contribute, such as a second copy of a block
/// or a block past the total, get no range.
fn payload_ranges(message: &Reassembled) -> Vec<Option<Range<u32>>> {
    let total = message.total_len();
    if message.discipline() == Discipline::ByteOffset {
        return message
            .fragments()
            .iter()
            .map(|fragment| {
                let end = fragment.position.saturating_add(fragment.len).min(total);
                (fragment.position < end).then_some(fragment.position..end)
            })
            .collect();
    }

    let mut offset = 0_u32;
    let mut seen = None;
    message
        .fragments()
        .iter()
        .map(|fragment| {
            if seen == Some(fragment.position) || fragment.position >= total {
                return None;
            }
            seen = Some(fragment.position);
            let start = offset;
            offset = offset.saturating_add(fragment.len);
            Some(start..offset)
        })
        .collect()
}

fn describe(kind: AnomalyKind) -> &'static str {
    match kind {
        AnomalyKind::Overlap => "Overlap",
        AnomalyKind::OverlapConflict => "Overlapping data differs",
        AnomalyKind::MultipleTails => "Multiple tail fragments",
        AnomalyKind::TooLong => "Fragment too long",
    }
}

fn singular(unit: &str) -> &str { unit.strip_suffix('s').unwrap_or(unit) }

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;

    use super::*;

    fn summary(frame: u32, position: u32, len: u32, anomalies: Anomalies) -> FragmentSummary {
        FragmentSummary {
            frame: FrameNumber::new(frame),
            position,
            len,
            last: false,
            anomalies,
        }
    }

    fn message(discipline: Discipline, total: u32, data: &'static [u8], fragments: Vec<FragmentSummary>) -> Reassembled {
        let anomalies = fragments.iter().map(|f| f.anomalies).fold(Anomalies::NONE, Anomalies::union);
        Reassembled {
            discipline,
            data: Bytes::from_static(data),
            total,
            reassembled_in: FrameNumber::new(3),
            anomalies,
            fragments,
        }
    }

    #[test]
    fn conflicting_fragment_is_annotated() {
        let conflict = Anomalies {
            overlap: true,
            overlap_conflict: true,
            ..Anomalies::NONE
        };
        let reassembled = message(
            Discipline::ByteOffset,
            15,
            b"AAAAAAAAAABBBBB",
            vec![summary(1, 0, 10, Anomalies::NONE), summary(2, 5, 10, conflict)],
        );
        let items = show_fragment_tree(&reassembled, &TreeLabels::new("IPv4"));

        assert_eq!(items[0].text, "[2 IPv4 Fragments (15 bytes): #1(10), #2(10)]");
        assert_eq!(
            items[2].text,
            "[Frame: 2, payload: 5-14 (10 bytes)][Overlap][Overlapping data differs]"
        );
        assert_eq!(items[2].range, Some(5..15));
        assert_eq!(items[3].text, "[Message anomalies: overlap, overlap-conflict]");
        assert_eq!(items.last().map(|i| i.text.as_str()), Some("[Reassembled IPv4 length: 15]"));
    }

    #[rstest]
    #[case(Discipline::BlockSequence)]
    #[case(Discipline::NoSequence)]
    fn block_ranges_follow_concatenation(#[case] discipline: Discipline) {
        let reassembled = message(
            discipline,
            2,
            b"abcde",
            vec![summary(1, 0, 2, Anomalies::NONE), summary(2, 1, 3, Anomalies::NONE)],
        );
        let items = show_fragment_tree(&reassembled, &TreeLabels::new("SCTP").with_unit("Segments"));
        assert_eq!(items[0].text, "[2 SCTP Segments (5 bytes): #1(2), #2(3)]");
        assert_eq!(items[2].range, Some(2..5));
        assert!(render(&items).contains("    [Segment count: 2]\n"));
    }

    #[test]
    fn render_indents_children() {
        let reassembled = message(Discipline::ByteOffset, 2, b"ok", vec![summary(3, 0, 2, Anomalies::NONE)]);
        let text = render(&show_fragment_tree(&reassembled, &TreeLabels::new("UDP")));
        assert!(text.starts_with("[1 UDP Fragments (2 bytes): #3(2)]\n    [Frame: 3, payload: 0-1 (2 bytes)]\n"));
        assert!(text.contains("    [Reassembled in frame: 3]\n"));
    }
}
