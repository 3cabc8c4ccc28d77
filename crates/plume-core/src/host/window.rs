//! In-memory window partition used by the reference host.

use crate::datum::Datum;
use crate::error::HostError;

use super::{HostResult, PartitionLocal, SeekType, WindowArg, WindowFrame};

/// One partition of a window query, already sorted.
///
/// Rows sharing a peer group compare equal under the window's ORDER BY. The frame is the
/// default one: partition start through the last peer of the current row.
#[derive(Clone, Debug)]
pub struct WindowPartition {
    rows: Vec<Vec<Datum>>,
    peer_groups: Vec<usize>,
    current: usize,
    mark: usize,
    local: PartitionLocal,
}

impl WindowPartition {
    /// Every row is its own peer group.
    pub fn new(rows: Vec<Vec<Datum>>) -> Self {
        let peer_groups = (0..rows.len()).collect();
        Self::with_peer_groups(rows, peer_groups)
    }

    pub fn with_peer_groups(rows: Vec<Vec<Datum>>, peer_groups: Vec<usize>) -> Self {
        Self {
            rows,
            peer_groups,
            current: 0,
            mark: 0,
            local: PartitionLocal::default(),
        }
    }

    /// Groups rows whose order key is equal to the previous row's.
    pub fn ordered_by(rows: Vec<Vec<Datum>>, keys: &[Datum]) -> Self {
        let mut groups = Vec::with_capacity(rows.len());
        let mut group = 0;
        for idx in 0..rows.len() {
            if idx > 0 && keys.get(idx) != keys.get(idx - 1) {
                group += 1;
            }
            groups.push(group);
        }
        Self::with_peer_groups(rows, groups)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn set_current(&mut self, pos: usize) {
        self.current = pos;
    }

    pub fn local(&self) -> &PartitionLocal {
        &self.local
    }

    fn frame_end(&self) -> usize {
        let group = self.peer_groups.get(self.current).copied();
        let mut end = self.current;
        while end + 1 < self.rows.len() && self.peer_groups.get(end + 1).copied() == group {
            end += 1;
        }
        end
    }

    fn fetch(&mut self, argno: usize, abs: i64, bounds: (usize, usize), set_mark: bool) -> HostResult<WindowArg> {
        let (start, end) = bounds;
        if abs < start as i64 || abs > end as i64 || self.rows.is_empty() {
            return Ok(WindowArg::OutOfRange);
        }
        let pos = abs as usize;
        if pos < self.mark {
            return Err(HostError::new(
                "cannot fetch row before WindowObject's mark position",
            ));
        }
        if set_mark {
            self.mark = pos;
        }
        let value = self.rows[pos]
            .get(argno)
            .cloned()
            .ok_or_else(|| HostError::new(format!("argument {argno} is out of range")))?;
        Ok(WindowArg::Value(value))
    }
}

impl WindowFrame for WindowPartition {
    fn current_position(&self) -> i64 {
        self.current as i64
    }

    fn partition_row_count(&self) -> i64 {
        self.rows.len() as i64
    }

    fn set_mark_position(&mut self, pos: i64) -> HostResult<()> {
        if pos < self.mark as i64 {
            return Err(HostError::new(
                "cannot move WindowObject's mark position backward",
            ));
        }
        self.mark = pos as usize;
        Ok(())
    }

    fn rows_are_peers(&self, a: i64, b: i64) -> HostResult<bool> {
        let group = |pos: i64| {
            usize::try_from(pos)
                .ok()
                .and_then(|pos| self.peer_groups.get(pos).copied())
                .ok_or_else(|| HostError::new(format!("row position {pos} is out of range")))
        };
        Ok(group(a)? == group(b)?)
    }

    fn arg_in_partition(
        &mut self,
        argno: usize,
        relpos: i64,
        seek: SeekType,
        set_mark: bool,
    ) -> HostResult<WindowArg> {
        let last = self.rows.len().saturating_sub(1);
        let abs = match seek {
            SeekType::Current => self.current as i64 + relpos,
            SeekType::Head => relpos,
            SeekType::Tail => last as i64 + relpos,
        };
        self.fetch(argno, abs, (0, last), set_mark)
    }

    fn arg_in_frame(
        &mut self,
        argno: usize,
        relpos: i64,
        seek: SeekType,
        set_mark: bool,
    ) -> HostResult<WindowArg> {
        let end = self.frame_end();
        let abs = match seek {
            SeekType::Current => self.current as i64 + relpos,
            SeekType::Head => relpos,
            SeekType::Tail => end as i64 + relpos,
        };
        self.fetch(argno, abs, (0, end), set_mark)
    }

    fn arg_current(&self, argno: usize) -> HostResult<Datum> {
        self.rows
            .get(self.current)
            .and_then(|row| row.get(argno))
            .cloned()
            .ok_or_else(|| HostError::new(format!("argument {argno} is out of range")))
    }

    fn partition_local(&mut self) -> &mut PartitionLocal {
        &mut self.local
    }
}
