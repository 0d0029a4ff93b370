// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Precomputed branch targets of one function body.
//!
//! A single scan over the body keeps a stack of open constructs, each with a
//! label. Forward labels collect the positions referencing them until their
//! `end` binds them; loop labels are bound on entry. All positions are byte
//! offsets relative to the start of the body (local declarations included).
//!
//! Targets, given as the position execution continues at:
//!
//! - a branch to a block, `if` or the function body lands after its `end`
//! - a branch to a loop lands on the `loop` opcode, which re-enters it
//! - a false `if` lands after its `else`, or on its `end` if there is none
//! - an `else` reached from the true arm lands after the `end`
//!
//! Entry `j` of a `br_table` at `pc` is keyed by `pc + j`.

use crate::errors::Error;
use hashbrown::HashMap;
use wasmparser::{BinaryReader, Operator};

#[derive(Debug, Clone, Default)]
pub(crate) struct ControlTransferMap {
    map: HashMap<u32, i32>,
}

impl ControlTransferMap {
    /// Scans `body` starting after the local declarations at `start`.
    pub(crate) fn new(body: &[u8], start: usize) -> crate::Result<Self> {
        let mut builder = Builder::default();
        let function = builder.new_label();
        builder.controls.push(Control {
            end_label: function,
            else_label: None,
        });

        let mut reader = BinaryReader::new(&body[start..], start);
        while !reader.eof() {
            let pc = position(reader.original_position());
            match reader.read_operator()? {
                Operator::Block { .. } => {
                    let end_label = builder.new_label();
                    builder.controls.push(Control {
                        end_label,
                        else_label: None,
                    });
                }
                Operator::Loop { .. } => {
                    let label = builder.new_label();
                    builder.bind(label, pc);
                    builder.controls.push(Control {
                        end_label: label,
                        else_label: None,
                    });
                }
                Operator::If { .. } => {
                    let else_label = builder.new_label();
                    builder.reference(else_label, pc);
                    let end_label = builder.new_label();
                    builder.controls.push(Control {
                        end_label,
                        else_label: Some(else_label),
                    });
                }
                Operator::Else => {
                    let control = builder.controls.last_mut().ok_or_else(|| malformed(pc))?;
                    let end_label = control.end_label;
                    let else_label = control.else_label.take().ok_or_else(|| malformed(pc))?;
                    builder.reference(end_label, pc);
                    builder.bind(else_label, pc + 1);
                }
                Operator::End => {
                    let control = builder.controls.pop().ok_or_else(|| malformed(pc))?;
                    if let Some(else_label) = control.else_label {
                        builder.bind(else_label, pc);
                    }
                    builder.bind(control.end_label, pc + 1);
                }
                Operator::Br { relative_depth } | Operator::BrIf { relative_depth } => {
                    let label = builder.label_at(relative_depth, pc)?;
                    builder.reference(label, pc);
                }
                Operator::BrTable { targets } => {
                    let mut key = pc;
                    for depth in targets.targets() {
                        let label = builder.label_at(depth?, pc)?;
                        builder.reference(label, key);
                        key += 1;
                    }
                    let label = builder.label_at(targets.default(), pc)?;
                    builder.reference(label, key);
                }
                _ => {}
            }
        }

        if !builder.controls.is_empty() {
            return Err(malformed(position(reader.original_position())));
        }
        Ok(Self { map: builder.map })
    }

    /// Signed distance from `pc` to its target.
    pub(crate) fn lookup(&self, pc: u32) -> Option<i32> {
        self.map.get(&pc).copied()
    }

    /// Position execution continues at when the transfer keyed by `pc` is
    /// taken.
    pub(crate) fn target(&self, pc: u32) -> Option<u32> {
        pc.checked_add_signed(self.lookup(pc)?)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

fn position(pos: usize) -> u32 {
    u32::try_from(pos).unwrap_or(u32::MAX)
}

fn malformed(pc: u32) -> Error {
    Error::InvalidWebAssembly {
        message: "control constructs are not properly nested".to_string(),
        offset: pc as usize,
    }
}

#[derive(Debug, Default)]
struct Label {
    target: Option<u32>,
    refs: Vec<u32>,
}

#[derive(Debug)]
struct Control {
    end_label: usize,
    /// Pending until an `else` or `end` binds it.
    else_label: Option<usize>,
}

#[derive(Debug, Default)]
struct Builder {
    labels: Vec<Label>,
    controls: Vec<Control>,
    map: HashMap<u32, i32>,
}

impl Builder {
    fn new_label(&mut self) -> usize {
        self.labels.push(Label::default());
        self.labels.len() - 1
    }

    fn label_at(&self, depth: u32, pc: u32) -> crate::Result<usize> {
        let index = (self.controls.len())
            .checked_sub(1 + depth as usize)
            .ok_or_else(|| Error::InvalidWebAssembly {
                message: format!("invalid branch depth: {depth}"),
                offset: pc as usize,
            })?;
        Ok(self.controls[index].end_label)
    }

    /// Binds `label` to `target` and resolves every earlier reference. A
    /// label is bound once.
    fn bind(&mut self, label: usize, target: u32) {
        let label = &mut self.labels[label];
        if label.target.is_some() {
            return;
        }
        label.target = Some(target);
        for from in label.refs.drain(..) {
            self.map.insert(from, delta(from, target));
        }
    }

    fn reference(&mut self, label: usize, from: u32) {
        let label = &mut self.labels[label];
        match label.target {
            Some(target) => {
                self.map.insert(from, delta(from, target));
            }
            None => label.refs.push(from),
        }
    }
}

fn delta(from: u32, to: u32) -> i32 {
    (i64::from(to) - i64::from(from)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Structured control flow without operands beyond what branching needs.
    #[derive(Debug, Clone)]
    enum Node {
        Nop,
        Block(Vec<Node>),
        Loop(Vec<Node>),
        If(Vec<Node>, Option<Vec<Node>>),
        Br(u8),
        BrIf(u8),
        BrTable(Vec<u8>, u8),
    }

    fn node() -> impl Strategy<Value = Node> {
        let leaf = prop_oneof![
            Just(Node::Nop),
            any::<u8>().prop_map(Node::Br),
            any::<u8>().prop_map(Node::BrIf),
            (prop::collection::vec(any::<u8>(), 0..4), any::<u8>())
                .prop_map(|(targets, default)| Node::BrTable(targets, default)),
        ];
        leaf.prop_recursive(5, 48, 4, |inner| {
            let body = prop::collection::vec(inner, 0..4);
            prop_oneof![
                body.clone().prop_map(Node::Block),
                body.clone().prop_map(Node::Loop),
                (body.clone(), prop::option::of(body)).prop_map(|(t, e)| Node::If(t, e)),
            ]
        })
    }

    fn encode(nodes: &[Node], depth: u8, out: &mut Vec<u8>) {
        let clamp = |d: u8| d % (depth + 1);
        for node in nodes {
            match node {
                Node::Nop => out.push(0x01),
                Node::Block(body) | Node::Loop(body) => {
                    out.push(if matches!(node, Node::Block(_)) { 0x02 } else { 0x03 });
                    out.push(0x40);
                    encode(body, depth + 1, out);
                    out.push(0x0b);
                }
                Node::If(then, els) => {
                    out.extend([0x41, 0x00, 0x04, 0x40]);
                    encode(then, depth + 1, out);
                    if let Some(els) = els {
                        out.push(0x05);
                        encode(els, depth + 1, out);
                    }
                    out.push(0x0b);
                }
                Node::Br(d) => out.extend([0x0c, clamp(*d)]),
                Node::BrIf(d) => out.extend([0x41, 0x00, 0x0d, clamp(*d)]),
                Node::BrTable(targets, default) => {
                    out.extend([0x41, 0x00, 0x0e, targets.len() as u8]);
                    out.extend(targets.iter().map(|d| clamp(*d)));
                    out.push(clamp(*default));
                }
            }
        }
    }

    fn body(nodes: &[Node]) -> Vec<u8> {
        // no local declarations
        let mut out = vec![0x00];
        encode(nodes, 0, &mut out);
        out.push(0x0b);
        out
    }

    /// Decoded operator positions, the reference re-scans these from the
    /// start for every query.
    fn decode(body: &[u8]) -> Vec<(u32, Operator<'_>)> {
        let mut reader = BinaryReader::new(&body[1..], 1);
        let mut ops = Vec::new();
        while !reader.eof() {
            let pc = position(reader.original_position());
            ops.push((pc, reader.read_operator().unwrap()));
        }
        ops
    }

    /// Position of the `end` matching the construct opened at `ops[open]`.
    fn matching_end(ops: &[(u32, Operator<'_>)], open: usize) -> usize {
        let mut depth = 0;
        for (i, (_, op)) in ops.iter().enumerate().skip(open + 1) {
            match op {
                Operator::Block { .. } | Operator::Loop { .. } | Operator::If { .. } => depth += 1,
                Operator::End if depth == 0 => return i,
                Operator::End => depth -= 1,
                _ => {}
            }
        }
        unreachable!("unbalanced body")
    }

    /// Matching `else` of the `if` at `ops[open]`, if any.
    fn matching_else(ops: &[(u32, Operator<'_>)], open: usize) -> Option<usize> {
        let mut depth = 0;
        for (i, (_, op)) in ops.iter().enumerate().skip(open + 1) {
            match op {
                Operator::Block { .. } | Operator::Loop { .. } | Operator::If { .. } => depth += 1,
                Operator::Else if depth == 0 => return Some(i),
                Operator::End if depth == 0 => return None,
                Operator::End => depth -= 1,
                _ => {}
            }
        }
        None
    }

    /// Target of the branch to the construct `depth` levels up, found by
    /// walking the body from its start up to `at`.
    fn branch_target(ops: &[(u32, Operator<'_>)], at: usize, depth: u32, limit: u32) -> u32 {
        // indices of open constructs, `None` is the function body
        let mut open: Vec<Option<usize>> = vec![None];
        for (i, (_, op)) in ops.iter().enumerate().take(at) {
            match op {
                Operator::Block { .. } | Operator::Loop { .. } | Operator::If { .. } => {
                    open.push(Some(i));
                }
                Operator::End => {
                    open.pop();
                }
                _ => {}
            }
        }
        match open[open.len() - 1 - depth as usize] {
            None => limit,
            Some(i) if matches!(ops[i].1, Operator::Loop { .. }) => ops[i].0,
            Some(i) => ops[matching_end(ops, i)].0 + 1,
        }
    }

    fn reference(body: &[u8]) -> Vec<(u32, u32)> {
        let ops = decode(body);
        let limit = position(body.len());
        let mut expected = Vec::new();
        for (i, (pc, op)) in ops.iter().enumerate() {
            match op {
                Operator::Br { relative_depth } | Operator::BrIf { relative_depth } => {
                    expected.push((*pc, branch_target(&ops, i, *relative_depth, limit)));
                }
                Operator::BrTable { targets } => {
                    let depths: Vec<u32> = targets
                        .targets()
                        .map(Result::unwrap)
                        .chain([targets.default()])
                        .collect();
                    for (j, depth) in depths.into_iter().enumerate() {
                        expected.push((*pc + j as u32, branch_target(&ops, i, depth, limit)));
                    }
                }
                Operator::If { .. } => {
                    let target = match matching_else(&ops, i) {
                        Some(e) => ops[e].0 + 1,
                        None => ops[matching_end(&ops, i)].0,
                    };
                    expected.push((*pc, target));
                }
                Operator::Else => {
                    // the construct the else belongs to ends at the next
                    // end on the same level
                    expected.push((*pc, ops[matching_end(&ops, i)].0 + 1));
                }
                _ => {}
            }
        }
        expected
    }

    #[test]
    fn nested_constructs() {
        // block
        //   loop
        //     i32.const 0
        //     br_if 1
        //     br 0
        //   end
        // end
        let body = [
            0x00, 0x02, 0x40, 0x03, 0x40, 0x41, 0x00, 0x0d, 0x01, 0x0c, 0x00, 0x0b, 0x0b, 0x0b,
        ];
        let map = ControlTransferMap::new(&body, 1).unwrap();
        assert_eq!(map.len(), 2);
        // br_if 1 leaves the block
        assert_eq!(map.target(7), Some(13));
        // br 0 restarts the loop
        assert_eq!(map.target(9), Some(3));
        assert_eq!(map.lookup(9), Some(-6));
    }

    #[test]
    fn if_else() {
        // i32.const 0, if, nop, else, nop, end
        let body = [0x00, 0x41, 0x00, 0x04, 0x40, 0x01, 0x05, 0x01, 0x0b, 0x0b];
        let map = ControlTransferMap::new(&body, 1).unwrap();
        assert_eq!(map.target(3), Some(7));
        assert_eq!(map.target(6), Some(9));

        // without else the false arm lands on the end
        let body = [0x00, 0x41, 0x00, 0x04, 0x40, 0x01, 0x0b, 0x0b];
        let map = ControlTransferMap::new(&body, 1).unwrap();
        assert_eq!(map.target(3), Some(6));
    }

    #[test]
    fn rejects_bad_nesting() {
        assert!(ControlTransferMap::new(&[0x00, 0x02, 0x40, 0x0b], 1).is_err());
        assert!(ControlTransferMap::new(&[0x00, 0x0c, 0x01, 0x0b], 1).is_err());
    }

    proptest! {
        #[test]
        fn matches_rescanning_reference(nodes in prop::collection::vec(node(), 0..6)) {
            let body = body(&nodes);
            let map = ControlTransferMap::new(&body, 1).unwrap();
            let expected = reference(&body);

            prop_assert_eq!(map.len(), expected.len());
            for (pc, target) in expected {
                prop_assert_eq!(map.target(pc), Some(target), "transfer at {}", pc);
            }
        }
    }
}
