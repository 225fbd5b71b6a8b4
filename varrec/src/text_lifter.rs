//! A reader for textual listings of already-lifted functions.
//!
//! A listing looks like
//!
//! ```text
//! arch amd64
//! function 0x1000
//!
//! block 0x1000 0xc
//!   0x1000 INT_SUB  rsp  rsp  $0x10:8
//!   0x1004 STORE    _    t0:8 rax
//!   0x1008 CALL     _    @0x2000
//! edge 0x1000 0x100c
//! call 0x1000 callee 0x2000 sp_delta 8
//! ```
//!
//! Instruction lines are `<address> <OP> <output> <input0> <input1>`, with trailing unused
//! varnodes optional. Varnodes are registers by name (`rax`, `eax:4`) or by register-file offset
//! (`reg16:8`), temporaries (`t3:8`), constants (`$0x10:8`, `$-1:4`), code addresses
//! (`@0x2000`) or unused (`_`). A `call` line without `sp_delta` marks a callee whose calling
//! convention is not known; `sp_delta unknown` marks a known convention without a stack delta.
//! Everything following a `#` is a comment.

use crate::arch::Arch;
use crate::block::Block;
use crate::cfg::{CallSite, CallingConvention, FunctionGraph};
use crate::containers::unordered::UnorderedMap;
use crate::error::RecoveryError;
use crate::il::{Instruction, LiftedBlock, Op, Varnode};
use crate::log::*;

/// A function read from a listing, ready to be analyzed
#[derive(Debug)]
pub struct Listing {
    pub arch: Arch,
    pub graph: FunctionGraph,
    pub blocks: UnorderedMap<u64, Block>,
}

/// Read a listing. Dominance frontiers of the resulting graph are computed.
pub fn lift_from(listing: &str) -> Result<Listing, RecoveryError> {
    let mut arch: Option<Arch> = None;
    let mut graph: Option<FunctionGraph> = None;
    let mut blocks: Vec<LiftedBlock> = vec![];

    for (idx, line) in listing.lines().enumerate() {
        let line_no = idx + 1;
        let fail = |reason: String| RecoveryError::InvalidListing {
            line: line_no,
            reason,
        };
        let line = match line.split_once('#') {
            Some((l, _)) => l,
            None => line,
        };
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [] => {}
            ["arch", name] => {
                arch = Some(
                    Arch::by_name(name).ok_or_else(|| fail(format!("unknown arch {:?}", name)))?,
                );
            }
            ["function", addr] => {
                graph = Some(FunctionGraph::new(parse_u64(addr).map_err(fail)?));
            }
            ["block", addr, size] => {
                let addr = parse_u64(addr).map_err(fail)?;
                let size = parse_u64(size).map_err(fail)? as usize;
                graph
                    .as_mut()
                    .ok_or_else(|| fail("block before `function`".into()))?
                    .add_node(addr, size);
                blocks.push(LiftedBlock {
                    addr,
                    size,
                    instructions: vec![],
                });
            }
            ["edge", from, to] => {
                let from = parse_u64(from).map_err(fail)?;
                let to = parse_u64(to).map_err(fail)?;
                graph
                    .as_mut()
                    .ok_or_else(|| fail("edge before `function`".into()))?
                    .add_edge(from, to);
            }
            ["entry", addr] => {
                let addr = parse_u64(addr).map_err(fail)?;
                graph
                    .as_mut()
                    .ok_or_else(|| fail("entry before `function`".into()))?
                    .set_entry(addr);
            }
            ["call", block, rest @ ..] => {
                let block = parse_u64(block).map_err(fail)?;
                let site = parse_call_site(rest).map_err(fail)?;
                graph
                    .as_mut()
                    .ok_or_else(|| fail("call before `function`".into()))?
                    .add_call_site(block, site);
            }
            [addr, op, varnodes @ ..] => {
                let arch = arch
                    .as_ref()
                    .ok_or_else(|| fail("instruction before `arch`".into()))?;
                let block = blocks
                    .last_mut()
                    .ok_or_else(|| fail("instruction outside of a block".into()))?;
                let ins = parse_instruction(arch, addr, op, varnodes).map_err(fail)?;
                block.instructions.push(ins);
            }
            [l] => return Err(fail(format!("unexpected line {:?}", l))),
        }
    }

    let arch = arch.ok_or(RecoveryError::InvalidListing {
        line: 0,
        reason: "missing `arch`".into(),
    })?;
    let mut graph = graph.ok_or(RecoveryError::InvalidListing {
        line: 0,
        reason: "missing `function`".into(),
    })?;
    graph.compute_dominance_frontiers();
    debug!("Read listing";
           "func" => format_args!("{:#x}", graph.func_addr),
           "blocks" => blocks.len());

    Ok(Listing {
        arch,
        graph,
        blocks: blocks.into_iter().map(|b| (b.addr, b.into())).collect(),
    })
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let r = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    r.map_err(|e| format!("bad number {:?}: {}", s, e))
}

fn parse_i64(s: &str) -> Result<i64, String> {
    match s.strip_prefix('-') {
        Some(s) => parse_u64(s).map(|n| (n as i64).wrapping_neg()),
        None => parse_u64(s).map(|n| n as i64),
    }
}

fn parse_call_site(tokens: &[&str]) -> Result<CallSite, String> {
    let mut site = CallSite {
        callee: None,
        convention: None,
    };
    let mut tokens = tokens.iter();
    while let Some(&key) = tokens.next() {
        let value = tokens
            .next()
            .ok_or_else(|| format!("missing value for {:?}", key))?;
        match key {
            "callee" => site.callee = Some(parse_u64(value)?),
            "sp_delta" => {
                let sp_delta = match *value {
                    "unknown" => None,
                    v => Some(parse_i64(v)?),
                };
                site.convention = Some(CallingConvention { sp_delta });
            }
            k => return Err(format!("unknown call attribute {:?}", k)),
        }
    }
    Ok(site)
}

fn parse_op(op: &str) -> Result<Op, String> {
    Ok(match op {
        "COPY" => Op::Copy,
        "INT_ADD" => Op::IntAdd,
        "INT_SUB" => Op::IntSub,
        "INT_MULT" => Op::IntMult,
        "INT_AND" => Op::IntAnd,
        "INT_OR" => Op::IntOr,
        "INT_XOR" => Op::IntXor,
        "INT_LEFT" => Op::IntLeftShift,
        "INT_RIGHT" => Op::IntURightShift,
        "INT_SRIGHT" => Op::IntSRightShift,
        "INT_ZEXT" => Op::IntZext,
        "INT_SEXT" => Op::IntSext,
        "INT_EQUAL" => Op::IntEqual,
        "INT_NOTEQUAL" => Op::IntNotEqual,
        "INT_LESS" => Op::IntLess,
        "INT_SLESS" => Op::IntSLess,
        "LOAD" => Op::Load,
        "STORE" => Op::Store,
        "BRANCH" => Op::Branch,
        "CBRANCH" => Op::Cbranch,
        "CALL" => Op::Call,
        "CALLIND" => Op::CallIndirect,
        "RETURN" => Op::Return,
        "NOP" => Op::Nop,
        "UNDERSPECIFIED" => Op::UnderspecifiedOutputModification,
        _ => return Err(format!("unknown op {:?}", op)),
    })
}

fn parse_instruction(
    arch: &Arch,
    addr: &str,
    op: &str,
    varnodes: &[&str],
) -> Result<Instruction, String> {
    if varnodes.len() > 3 {
        return Err(format!("too many varnodes: {:?}", varnodes));
    }
    let address = parse_u64(addr)?;
    let op = parse_op(op)?;
    let mut vns = [Varnode::Unused; 3];
    for (slot, s) in vns.iter_mut().zip(varnodes) {
        *slot = parse_varnode(arch, s)?;
    }
    let [output, i0, i1] = vns;
    Ok(Instruction::new(address, op, output, [i0, i1]))
}

fn parse_sized<'a>(s: &'a str) -> Result<(&'a str, Option<usize>), String> {
    match s.rsplit_once(':') {
        Some((v, size)) => Ok((v, Some(parse_u64(size)? as usize))),
        None => Ok((s, None)),
    }
}

fn parse_varnode(arch: &Arch, s: &str) -> Result<Varnode, String> {
    if s == "_" {
        return Ok(Varnode::Unused);
    }
    if let Some(addr) = s.strip_prefix('@') {
        return Ok(Varnode::Address {
            addr: parse_u64(addr)?,
        });
    }
    if let Some(c) = s.strip_prefix('$') {
        let (value, size) = parse_sized(c)?;
        let size = size.unwrap_or_else(|| arch.bytes());
        let value = crate::value::mask(parse_i64(value)? as u64, size * 8);
        return Ok(Varnode::Constant { value, size });
    }
    let (name, size) = parse_sized(s)?;
    if let Some(idx) = name.strip_prefix('t').and_then(|i| i.parse::<usize>().ok()) {
        let size = size.ok_or_else(|| format!("temporary {:?} needs a size", s))?;
        return Ok(Varnode::Temporary { idx, size });
    }
    if let Some(offset) = name
        .strip_prefix("reg")
        .and_then(|o| o.parse::<usize>().ok())
    {
        let size = size.unwrap_or_else(|| arch.bytes());
        return Ok(Varnode::Register { offset, size });
    }
    match arch.register_by_name(name) {
        Some(reg) => Ok(Varnode::Register {
            offset: reg.offset,
            size: size.unwrap_or(reg.size),
        }),
        None => Err(format!("unknown varnode {:?}", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "
        arch amd64
        function 0x1000

        block 0x1000 0x8
          0x1000 INT_SUB  rsp  rsp  $0x10   # make room
          0x1004 CALL     _    @0x2000
        block 0x1008 0x4
          0x1008 RETURN   _    t0:8
        edge 0x1000 0x1008
        call 0x1000 callee 0x2000 sp_delta -8
    ";

    #[test]
    fn reads_blocks_edges_and_call_sites() {
        let l = lift_from(LISTING).unwrap();
        assert_eq!(l.arch, Arch::amd64());
        assert_eq!(l.graph.entry(), Some(0x1000));
        assert_eq!(l.graph.successors(0x1000).collect::<Vec<_>>(), vec![0x1008]);
        assert_eq!(
            l.graph.call_site(0x1000),
            Some(&CallSite {
                callee: Some(0x2000),
                convention: Some(CallingConvention { sp_delta: Some(-8) }),
            })
        );
        let first = match l.blocks.get(&0x1000).unwrap() {
            Block::Lifted(b) => b.clone(),
            b => panic!("unexpected block {:?}", b),
        };
        assert_eq!(first.size, 8);
        assert_eq!(
            first.instructions[0],
            Instruction::new(
                0x1000,
                Op::IntSub,
                Varnode::Register {
                    offset: 48,
                    size: 8
                },
                [
                    Varnode::Register {
                        offset: 48,
                        size: 8
                    },
                    Varnode::Constant {
                        value: 0x10,
                        size: 8
                    }
                ]
            )
        );
        assert_eq!(first.call_target(), Some(0x2000));
    }

    #[test]
    fn varnode_syntax() {
        let arch = Arch::amd64();
        assert_eq!(
            parse_varnode(&arch, "eax").unwrap(),
            Varnode::Register {
                offset: 16,
                size: 4
            }
        );
        assert_eq!(
            parse_varnode(&arch, "reg80:2").unwrap(),
            Varnode::Register {
                offset: 80,
                size: 2
            }
        );
        assert_eq!(
            parse_varnode(&arch, "$-1:4").unwrap(),
            Varnode::Constant {
                value: 0xffff_ffff,
                size: 4
            }
        );
        assert!(parse_varnode(&arch, "t1").is_err());
        assert!(parse_varnode(&arch, "xmm0").is_err());
    }

    #[test]
    fn call_without_delta_has_unknown_convention() {
        let site = parse_call_site(&["callee", "0x10"]).unwrap();
        assert_eq!(site.convention, None);
        let site = parse_call_site(&["sp_delta", "unknown"]).unwrap();
        assert_eq!(site.convention, Some(CallingConvention { sp_delta: None }));
    }

    #[test]
    fn errors_carry_the_line_number() {
        let err = lift_from("arch amd64\nfunction 0x10\nblock 0x10 4\n0x10 FROB _\n").unwrap_err();
        assert_eq!(
            err,
            RecoveryError::InvalidListing {
                line: 4,
                reason: "unknown op \"FROB\"".into()
            }
        );
        assert!(matches!(
            lift_from("function 0x10\n"),
            Err(RecoveryError::InvalidListing { line: 0, .. })
        ));
    }
}
