//! Remote byte segments: inclusive ranges of a file not yet downloaded.

/// An inclusive byte range `[begin, end]` still pending download for some file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSegment {
    pub segment_id: i64,
    pub begin: u64,
    pub end: u64,
}

impl RemoteSegment {
    pub fn overlaps(&self, range_begin: u64, range_end: u64) -> bool {
        self.begin <= range_end && self.end >= range_begin
    }
}

/// The four ways a deletion range `[del_begin, del_end]` can intersect an existing segment
/// `[b, e]`, per the metadata-store contract. Any overlapping segment must match exactly one
/// of these; anything else is store corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEdit {
    /// `b >= del_begin && e <= del_end`: the segment is fully covered, delete it.
    Delete,
    /// `del_begin > b && del_end < e`: split into `[b, del_begin-1]` and `[del_end+1, e]`.
    Split { left_end: u64, right_begin: u64 },
    /// `del_begin > b && del_begin <= e && del_end >= e`: truncate to `[b, del_begin-1]`.
    TruncateEnd { new_end: u64 },
    /// `del_begin <= b && del_end >= b && del_end < e`: advance to `[del_end+1, e]`.
    TruncateBegin { new_begin: u64 },
}

impl SegmentEdit {
    /// Classify how `[del_begin, del_end]` cuts into `[b, e]`. `segment` must already be
    /// known to overlap the deletion range; returns `None` if the shape doesn't match any of
    /// the four legal cases (store corruption).
    pub fn classify(segment: RemoteSegment, del_begin: u64, del_end: u64) -> Option<Self> {
        let (b, e) = (segment.begin, segment.end);
        if b >= del_begin && e <= del_end {
            Some(SegmentEdit::Delete)
        } else if del_begin > b && del_end < e {
            Some(SegmentEdit::Split { left_end: del_begin - 1, right_begin: del_end + 1 })
        } else if del_begin > b && del_begin <= e && del_end >= e {
            Some(SegmentEdit::TruncateEnd { new_end: del_begin - 1 })
        } else if del_begin <= b && del_end >= b && del_end < e {
            Some(SegmentEdit::TruncateBegin { new_begin: del_end + 1 })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(b: u64, e: u64) -> RemoteSegment {
        RemoteSegment { segment_id: 1, begin: b, end: e }
    }

    #[test]
    fn classify_delete_when_fully_covered() {
        assert_eq!(SegmentEdit::classify(seg(10, 20), 0, 100), Some(SegmentEdit::Delete));
        assert_eq!(SegmentEdit::classify(seg(10, 20), 10, 20), Some(SegmentEdit::Delete));
    }

    #[test]
    fn classify_split_when_strictly_interior() {
        assert_eq!(
            SegmentEdit::classify(seg(0, 99), 40, 59),
            Some(SegmentEdit::Split { left_end: 39, right_begin: 60 })
        );
    }

    #[test]
    fn classify_truncate_end_when_deletion_overhangs_right() {
        assert_eq!(
            SegmentEdit::classify(seg(0, 39), 30, 70),
            Some(SegmentEdit::TruncateEnd { new_end: 29 })
        );
    }

    #[test]
    fn classify_truncate_begin_when_deletion_overhangs_left() {
        assert_eq!(
            SegmentEdit::classify(seg(60, 99), 30, 70),
            Some(SegmentEdit::TruncateBegin { new_begin: 71 })
        );
    }
}
