//! Live interval construction.
//!
//! Positions are the preorder numbers the code generator's analysis pass
//! assigns to AST nodes. A variable is live from its definition to its last
//! use; a variable touched inside a loop but defined before it stays live
//! until the loop's end, since the back edge reaches earlier uses again.

use hashbrown::HashSet;

/// Index of a variable within one function.
pub type VarId = u32;

/// Program point in preorder numbering.
pub type ProgramPoint = u32;

/// Closed interval `[start, end]` during which a variable holds a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveInterval {
    pub var: VarId,
    pub start: ProgramPoint,
    pub end: ProgramPoint,
}

impl LiveInterval {
    pub fn overlaps(&self, other: &LiveInterval) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

struct LoopFrame {
    start: ProgramPoint,
    touched: HashSet<VarId>,
}

/// Incrementally records definitions and uses while the analysis walks a
/// function body.
#[derive(Default)]
pub struct IntervalBuilder {
    ranges: Vec<Option<(ProgramPoint, ProgramPoint)>>,
    loops: Vec<LoopFrame>,
    pinned: Vec<VarId>,
}

impl IntervalBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self, var: VarId, pos: ProgramPoint) {
        let idx = var as usize;
        if self.ranges.len() <= idx {
            self.ranges.resize(idx + 1, None);
        }
        let range = self.ranges[idx].get_or_insert((pos, pos));
        range.0 = range.0.min(pos);
        range.1 = range.1.max(pos);
        if let Some(frame) = self.loops.last_mut() {
            frame.touched.insert(var);
        }
    }

    pub fn define(&mut self, var: VarId, pos: ProgramPoint) {
        self.touch(var, pos);
    }

    pub fn use_var(&mut self, var: VarId, pos: ProgramPoint) {
        self.touch(var, pos);
    }

    /// Keep `var` live for the whole function (parameters, values a tail call
    /// rewrites).
    pub fn pin(&mut self, var: VarId) {
        self.touch(var, 0);
        self.pinned.push(var);
    }

    pub fn enter_loop(&mut self, pos: ProgramPoint) {
        self.loops.push(LoopFrame {
            start: pos,
            touched: HashSet::new(),
        });
    }

    pub fn exit_loop(&mut self, end: ProgramPoint) {
        let Some(frame) = self.loops.pop() else {
            return;
        };
        for &var in &frame.touched {
            if let Some(range) = self.ranges[var as usize].as_mut() {
                if range.0 <= frame.start {
                    range.1 = range.1.max(end);
                }
            }
        }
        if let Some(outer) = self.loops.last_mut() {
            outer.touched.extend(frame.touched);
        }
    }

    /// Produce intervals sorted by start point, then variable id.
    pub fn finish(mut self, function_end: ProgramPoint) -> Vec<LiveInterval> {
        for var in std::mem::take(&mut self.pinned) {
            if let Some(range) = self.ranges[var as usize].as_mut() {
                range.0 = 0;
                range.1 = range.1.max(function_end);
            }
        }
        let mut intervals: Vec<LiveInterval> = self
            .ranges
            .iter()
            .enumerate()
            .filter_map(|(var, range)| {
                range.map(|(start, end)| LiveInterval {
                    var: var as VarId,
                    start,
                    end,
                })
            })
            .collect();
        intervals.sort_by_key(|iv| (iv.start, iv.var));
        intervals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_straight_line_intervals() {
        let mut b = IntervalBuilder::new();
        b.define(0, 1);
        b.define(1, 2);
        b.use_var(0, 5);
        b.use_var(1, 3);
        let ivs = b.finish(10);
        assert_eq!(ivs[0], LiveInterval { var: 0, start: 1, end: 5 });
        assert_eq!(ivs[1], LiveInterval { var: 1, start: 2, end: 3 });
        assert!(ivs[0].overlaps(&ivs[1]));
    }

    #[test]
    fn test_loop_extends_outer_variables() {
        let mut b = IntervalBuilder::new();
        b.define(0, 1);
        b.enter_loop(4);
        b.use_var(0, 6);
        b.define(1, 7);
        b.use_var(1, 8);
        b.exit_loop(12);
        let ivs = b.finish(20);
        let sum = ivs.iter().find(|iv| iv.var == 0).unwrap();
        let local = ivs.iter().find(|iv| iv.var == 1).unwrap();
        assert_eq!(sum.end, 12);
        assert_eq!(local.end, 8);
    }

    #[test]
    fn test_nested_loop_propagates_to_outer() {
        let mut b = IntervalBuilder::new();
        b.define(0, 1);
        b.enter_loop(2);
        b.enter_loop(3);
        b.use_var(0, 4);
        b.exit_loop(5);
        b.exit_loop(9);
        let ivs = b.finish(10);
        assert_eq!(ivs[0].end, 9);
    }

    #[test]
    fn test_pinned_variable_spans_function() {
        let mut b = IntervalBuilder::new();
        b.pin(0);
        b.define(1, 3);
        let ivs = b.finish(40);
        assert_eq!(ivs[0], LiveInterval { var: 0, start: 0, end: 40 });
    }
}
