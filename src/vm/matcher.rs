//! Match tables: precomputed string-against-many dispatch.
//!
//! A table maps an input string to the instruction offset of the first
//! matching pattern, or to a default offset when nothing matches. Equality
//! tables hash the input, prefix and suffix tables walk a byte trie (the
//! suffix trie over reversed patterns), regex tables try compiled patterns
//! in order. Ties always go to the pattern that appears first in program
//! order.

use std::collections::HashMap;

use crate::vm::program::ConstantPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Equal,
    Prefix,
    Suffix,
    Regex,
}

/// One case of a match table, before index construction.
#[derive(Debug, Clone)]
pub struct MatchCase {
    pub pattern: MatchPattern,
    /// Instruction offset to continue at when this case wins.
    pub target: usize,
}

#[derive(Debug, Clone)]
pub enum MatchPattern {
    Literal(String),
    /// Index into the program's regex constant pool.
    Regex(u32),
}

#[derive(Debug)]
pub struct MatchTable {
    kind: MatchKind,
    default_target: usize,
    cases: Vec<MatchCase>,
    index: MatchIndex,
}

#[derive(Debug)]
enum MatchIndex {
    /// input -> case index
    Equal(HashMap<String, usize>),
    /// Trie over pattern bytes; suffix tables store patterns reversed.
    Trie(Trie),
    /// Case indices carrying regex pool references, tried in order.
    Regex(Vec<(u32, usize)>),
}

impl MatchTable {
    pub fn build(kind: MatchKind, default_target: usize, cases: Vec<MatchCase>) -> MatchTable {
        let index = match kind {
            MatchKind::Equal => {
                let mut map = HashMap::with_capacity(cases.len());
                for (i, case) in cases.iter().enumerate() {
                    if let MatchPattern::Literal(p) = &case.pattern {
                        // first pattern in program order wins
                        map.entry(p.clone()).or_insert(i);
                    }
                }
                MatchIndex::Equal(map)
            }
            MatchKind::Prefix | MatchKind::Suffix => {
                let mut trie = Trie::new();
                for (i, case) in cases.iter().enumerate() {
                    if let MatchPattern::Literal(p) = &case.pattern {
                        if kind == MatchKind::Prefix {
                            trie.insert(p.as_bytes().iter().copied(), i);
                        } else {
                            trie.insert(p.as_bytes().iter().rev().copied(), i);
                        }
                    }
                }
                MatchIndex::Trie(trie)
            }
            MatchKind::Regex => {
                let refs = cases
                    .iter()
                    .enumerate()
                    .filter_map(|(i, case)| match case.pattern {
                        MatchPattern::Regex(idx) => Some((idx, i)),
                        MatchPattern::Literal(_) => None,
                    })
                    .collect();
                MatchIndex::Regex(refs)
            }
        };
        MatchTable {
            kind,
            default_target,
            cases,
            index,
        }
    }

    pub fn kind(&self) -> MatchKind {
        self.kind
    }

    pub fn default_target(&self) -> usize {
        self.default_target
    }

    pub fn cases(&self) -> &[MatchCase] {
        &self.cases
    }

    /// Evaluate the table against `subject` and return the instruction
    /// offset to continue at. An empty table yields the default target.
    pub fn evaluate(&self, subject: &str, pool: &ConstantPool) -> usize {
        let winner = match &self.index {
            MatchIndex::Equal(map) => map.get(subject).copied(),
            MatchIndex::Trie(trie) => match self.kind {
                MatchKind::Prefix => trie.best_match(subject.as_bytes().iter().copied()),
                _ => trie.best_match(subject.as_bytes().iter().rev().copied()),
            },
            MatchIndex::Regex(refs) => refs
                .iter()
                .find(|(pool_idx, _)| {
                    pool.regex(*pool_idx)
                        .map(|re| re.is_match(subject))
                        .unwrap_or(false)
                })
                .map(|&(_, case)| case),
        };
        match winner {
            Some(case) => self.cases[case].target,
            None => self.default_target,
        }
    }
}

#[derive(Debug)]
struct TrieNode {
    children: HashMap<u8, usize>,
    /// Lowest case index terminating at this node.
    case: Option<usize>,
}

#[derive(Debug)]
struct Trie {
    nodes: Vec<TrieNode>,
}

impl Trie {
    fn new() -> Self {
        Trie {
            nodes: vec![TrieNode {
                children: HashMap::new(),
                case: None,
            }],
        }
    }

    fn insert(&mut self, bytes: impl Iterator<Item = u8>, case: usize) {
        let mut node = 0;
        for byte in bytes {
            node = match self.nodes[node].children.get(&byte) {
                Some(&next) => next,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(TrieNode {
                        children: HashMap::new(),
                        case: None,
                    });
                    self.nodes[node].children.insert(byte, next);
                    next
                }
            };
        }
        let slot = &mut self.nodes[node].case;
        if slot.map(|existing| case < existing).unwrap_or(true) {
            *slot = Some(case);
        }
    }

    /// Walk the input, collecting every terminal passed, and return the
    /// lowest case index seen (program order priority).
    fn best_match(&self, bytes: impl Iterator<Item = u8>) -> Option<usize> {
        let mut best = self.nodes[0].case;
        let mut node = 0;
        for byte in bytes {
            match self.nodes[node].children.get(&byte) {
                Some(&next) => {
                    node = next;
                    if let Some(case) = self.nodes[node].case {
                        if best.map(|b| case < b).unwrap_or(true) {
                            best = Some(case);
                        }
                    }
                }
                None => break,
            }
        }
        best
    }
}
