//! Ring cursor arithmetic.
//!
//! Cursors are byte offsets modulo the ring size. The consumer also keeps an
//! absolute (never wrapping) read position, and the producer's absolute
//! position can be reconstructed from the completed-period count, which is
//! what makes overrun detectable.

/// Fixed geometry of one ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    size: usize,
    period: usize,
}

impl RingGeometry {
    /// `size` must be even; the period is half the ring.
    pub fn new(size: usize) -> Self {
        debug_assert!(size >= 2 && size % 2 == 0);
        Self { size, period: size / 2 }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn period(&self) -> usize {
        self.period
    }

    /// Write cursor from a live residue. A residue equal to the ring size
    /// means the engine sits at the start of the ring.
    #[inline]
    pub fn write_cursor(&self, residue: usize) -> Option<usize> {
        match residue {
            r if r > self.size => None,
            r => Some((self.size - r) % self.size),
        }
    }

    /// Bytes between `read` and `write`, wraparound aware. Equal cursors
    /// mean empty.
    #[inline]
    pub fn available(&self, read: usize, write: usize) -> usize {
        if read <= write {
            write - read
        } else {
            write + self.size - read
        }
    }

    /// Split a copy of `len` bytes starting at `read` into the tail segment
    /// `[read, size)` and the head segment `[0, ..)`.
    #[inline]
    pub fn split(&self, read: usize, len: usize) -> (usize, usize) {
        let tail = (self.size - read).min(len);
        (tail, len - tail)
    }

    /// Offset in the ring of an absolute position.
    #[inline]
    pub fn offset(&self, pos: u64) -> usize {
        (pos % self.size as u64) as usize
    }

    /// Smallest absolute producer position `>= periods * period` that lands
    /// on `write`.
    pub fn absolute_write(&self, periods: u64, write: usize) -> u64 {
        let base = periods.saturating_mul(self.period as u64);
        let base_off = self.offset(base);
        let delta = self.available(base_off, write);
        base + delta as u64
    }
}

/// How much the consumer may copy now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lead {
    /// `n` unread bytes, `0 <= n <= size`.
    Available(usize),
    /// The producer is more than one ring ahead; `lost` bytes at least are
    /// gone and the consumer should resume at `resume_at`.
    Overrun { lost: u64, resume_at: u64 },
}

/// Classify the distance between the consumer and the producer.
///
/// `read_pos` is the consumer's absolute position; `periods`/`write` are
/// the producer's period count and live cursor.
pub fn lead(geom: &RingGeometry, read_pos: u64, periods: u64, write: usize) -> Lead {
    let produced = geom.absolute_write(periods, write);
    let size = geom.size() as u64;

    if produced < read_pos {
        // Period count lagging the live cursor; fall back to modular math.
        return Lead::Available(geom.available(geom.offset(read_pos), write));
    }

    let ahead = produced - read_pos;
    if ahead > size {
        Lead::Overrun {
            lost: ahead - size,
            resume_at: produced,
        }
    } else {
        Lead::Available(ahead as usize)
    }
}

/// [`lead`] against an engine that may already be writing `in_flight`
/// bytes past `write`. Unread bytes under that window count as lost; the
/// consumer resumes at the committed producer position.
pub fn lead_claimed(geom: &RingGeometry, read_pos: u64, periods: u64, write: usize, in_flight: usize) -> Lead {
    let size = geom.size() as u64;
    match lead(geom, read_pos, periods, write) {
        Lead::Available(n) if n as u64 + in_flight as u64 > size => Lead::Overrun {
            lost: n as u64 + in_flight as u64 - size,
            resume_at: read_pos + n as u64,
        },
        other => other,
    }
}
