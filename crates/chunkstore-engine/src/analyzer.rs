//! Offline consistency checks.
//!
//! The analyzer compares two independent views of the arena:
//!
//! 1. **Trie walk**: every table block and every live record entry, each
//!    claiming one allocated block.
//! 2. **Boundary-tag walk**: the marker chain from address 0 to the start
//!    of the free-list heads, recovering each block's extent from marker
//!    states, free-block length fields and the claims of step 1.
//!
//! Then it checks the size-class lists against the free blocks seen on the
//! walk and the heap counters against the walked totals. The walk stops at
//! the first block whose extent cannot be recovered (an unclaimed allocated
//! block or a broken marker); checks that need the complete walk are then
//! skipped and `walk_complete` is false.

use std::collections::BTreeMap;
use std::fmt;

use chunkstore_common::error::StoreResult;
use chunkstore_common::types::ChunkId;
use chunkstore_index::TranslationTable;
use chunkstore_memory::heap::marker::{self, Side};
use chunkstore_memory::{Address, Arena, Entry, Heap};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One inconsistency found by [`analyze`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Issue {
    /// An entry points outside the payload region. `id` is `None` for
    /// table blocks.
    AddressOutOfRange {
        /// Record id.
        id: Option<ChunkId>,
        /// Payload address from the entry.
        address: u64,
    },
    /// An entry does not point at the start of an allocated block.
    AddressMismatch {
        /// Record id.
        id: Option<ChunkId>,
        /// Payload address from the entry.
        address: u64,
        /// Description.
        detail: String,
    },
    /// A marker byte is invalid or disagrees with its neighbours.
    MarkerMismatch {
        /// Marker address.
        address: u64,
        /// Description.
        detail: String,
    },
    /// A length field or prefix width disagrees with the markers.
    LengthMismatch {
        /// Block start.
        address: u64,
        /// Description.
        detail: String,
    },
    /// An allocated block that no entry refers to.
    OrphanedBlock {
        /// Block start.
        address: u64,
    },
    /// Two free blocks next to each other.
    UncoalescedFree {
        /// Start of the second block.
        address: u64,
    },
    /// A size-class list disagrees with the free blocks on the walk.
    FreeListInconsistent {
        /// Size class.
        class: usize,
        /// Block start.
        address: u64,
        /// Description.
        detail: String,
    },
    /// A heap counter disagrees with the walked total.
    CounterMismatch {
        /// Counter name.
        counter: String,
        /// Value kept by the heap.
        recorded: u64,
        /// Value found by the walk.
        walked: u64,
    },
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = |id: &Option<ChunkId>| match id {
            Some(id) => format!("record {id}"),
            None => "table".to_string(),
        };
        match self {
            Issue::AddressOutOfRange { id, address } => {
                write!(f, "{} points outside the payload region at {address:#x}", owner(id))
            }
            Issue::AddressMismatch {
                id,
                address,
                detail,
            } => write!(f, "{} at {address:#x}: {detail}", owner(id)),
            Issue::MarkerMismatch { address, detail } => {
                write!(f, "marker at {address:#x}: {detail}")
            }
            Issue::LengthMismatch { address, detail } => {
                write!(f, "block at {address:#x}: {detail}")
            }
            Issue::OrphanedBlock { address } => {
                write!(f, "allocated block at {address:#x} has no entry")
            }
            Issue::UncoalescedFree { address } => {
                write!(f, "free block at {address:#x} follows another free block")
            }
            Issue::FreeListInconsistent {
                class,
                address,
                detail,
            } => write!(f, "free list {class}, block {address:#x}: {detail}"),
            Issue::CounterMismatch {
                counter,
                recorded,
                walked,
            } => write!(f, "counter {counter}: heap says {recorded}, walk found {walked}"),
        }
    }
}

/// Result of [`analyze`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Arena size in bytes.
    pub arena_size: u64,
    /// Size of the payload region (marker chain extent).
    pub payload_region: u64,
    /// Whether the boundary-tag walk reached the end of the region.
    pub walk_complete: bool,
    /// Table blocks found by the trie walk.
    pub tables: u64,
    /// Live records found by the trie walk.
    pub records: u64,
    /// Zombie slots found by the trie walk.
    pub zombies: u64,
    /// Free blocks on the walk.
    pub free_blocks: u64,
    /// Free bytes on the walk.
    pub free_bytes: u64,
    /// Allocated blocks on the walk.
    pub allocated_blocks: u64,
    /// Allocated block bytes (prefix included) on the walk.
    pub allocated_bytes: u64,
    /// Allocated payload bytes on the walk.
    pub payload_bytes: u64,
    /// Markers on the walk.
    pub marker_bytes: u64,
    /// Everything that did not add up.
    pub issues: Vec<Issue>,
}

impl AnalysisReport {
    /// Returns true if no issue was found.
    pub fn is_clean(&self) -> bool {
        self.walk_complete && self.issues.is_empty()
    }
}

impl fmt::Display for AnalysisReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "arena size:       {}", self.arena_size)?;
        writeln!(f, "payload region:   {}", self.payload_region)?;
        writeln!(f, "tables:           {}", self.tables)?;
        writeln!(f, "records:          {}", self.records)?;
        writeln!(f, "zombies:          {}", self.zombies)?;
        writeln!(
            f,
            "allocated:        {} blocks, {} bytes ({} payload)",
            self.allocated_blocks, self.allocated_bytes, self.payload_bytes
        )?;
        writeln!(
            f,
            "free:             {} blocks, {} bytes",
            self.free_blocks, self.free_bytes
        )?;
        writeln!(f, "markers:          {}", self.marker_bytes)?;
        if !self.walk_complete {
            writeln!(f, "walk:             incomplete")?;
        }
        if self.issues.is_empty() {
            write!(f, "no issues found")
        } else {
            write!(f, "{} issue(s):", self.issues.len())?;
            for issue in &self.issues {
                write!(f, "\n  - {issue}")?;
            }
            Ok(())
        }
    }
}

/// An allocated block claimed by an entry.
#[derive(Debug, Clone, Copy)]
struct Claim {
    id: Option<ChunkId>,
    entry: Entry,
    size: u64,
}

/// Checks the heap behind `heap` against the entries reachable from
/// `table`. Both must sit on the same arena; nothing may mutate it while
/// the analysis runs.
pub fn analyze<A: Arena>(heap: &Heap<A>, table: &TranslationTable<A>) -> StoreResult<AnalysisReport> {
    let layout = heap.layout();
    let mut report = AnalysisReport {
        arena_size: layout.arena_size,
        payload_region: layout.base_free_list,
        ..AnalysisReport::default()
    };

    let scan = table.scan()?;
    let mut claims = BTreeMap::new();
    for entry in scan.tables {
        report.tables += 1;
        claim(heap, &mut claims, &mut report, None, entry)?;
    }
    for (slot, entry) in scan.stray {
        warn!(slot = %slot, address = %entry.address(), "table entry points outside the arena");
        report.issues.push(Issue::AddressOutOfRange {
            id: None,
            address: entry.address().as_u64(),
        });
    }
    for (id, entry) in scan.live {
        report.records += 1;
        claim(heap, &mut claims, &mut report, Some(id), entry)?;
    }
    report.zombies = scan.zombies;

    let mut listed = BTreeMap::new();
    report.walk_complete = walk(heap, &mut claims, &mut listed, &mut report)?;

    if report.walk_complete {
        for (start, claim) in claims {
            report.issues.push(Issue::AddressMismatch {
                id: claim.id,
                address: claim.entry.address().as_u64(),
                detail: format!("no allocated block starts at {start:#x}"),
            });
        }
    }
    check_lists(heap, &mut listed, &mut report);
    if report.walk_complete {
        check_counters(heap, &mut report);
    }

    if report.is_clean() {
        debug!(
            records = report.records,
            tables = report.tables,
            "analysis found no issues"
        );
    } else {
        warn!(
            issues = report.issues.len(),
            walk_complete = report.walk_complete,
            "analysis found inconsistencies"
        );
    }
    Ok(report)
}

/// Books the block behind `entry` under its start address.
fn claim<A: Arena>(
    heap: &Heap<A>,
    claims: &mut BTreeMap<u64, Claim>,
    report: &mut AnalysisReport,
    id: Option<ChunkId>,
    entry: Entry,
) -> StoreResult<()> {
    let base = heap.layout().base_free_list;
    let address = entry.address().as_u64();
    let width = entry.prefix_width() as u64;
    if address < width + 1 || address >= base {
        report.issues.push(Issue::AddressOutOfRange { id, address });
        return Ok(());
    }

    let payload = heap.payload_len(entry)?;
    if address + payload >= base {
        report.issues.push(Issue::AddressOutOfRange { id, address });
        return Ok(());
    }

    let start = address - width;
    let new = Claim {
        id,
        entry,
        size: width + payload,
    };
    if let Some(existing) = claims.insert(start, new) {
        let holder = existing
            .id
            .map_or_else(|| "a table".to_string(), |id| format!("record {id}"));
        report.issues.push(Issue::AddressMismatch {
            id,
            address,
            detail: format!("block already claimed by {holder}"),
        });
    }
    Ok(())
}

fn read_marker<A: Arena>(heap: &Heap<A>, at: u64) -> StoreResult<Option<(Side, Side)>> {
    let byte = heap.arena().read(Address::new(at), 1)? as u8;
    Ok(marker::decode(byte))
}

/// Walks the marker chain. Returns true if it reached the closing marker.
fn walk<A: Arena>(
    heap: &Heap<A>,
    claims: &mut BTreeMap<u64, Claim>,
    listed: &mut BTreeMap<u64, u64>,
    report: &mut AnalysisReport,
) -> StoreResult<bool> {
    let layout = heap.layout();
    let arena = heap.arena();
    let last_marker = layout.base_free_list - 1;

    let mut at = 0u64;
    let mut expected_left = Side::Edge;
    let mut previous_free = false;
    loop {
        let Some((left, right)) = read_marker(heap, at)? else {
            report.issues.push(Issue::MarkerMismatch {
                address: at,
                detail: "invalid marker byte".to_string(),
            });
            return Ok(false);
        };
        report.marker_bytes += 1;

        if left != expected_left {
            report.issues.push(Issue::MarkerMismatch {
                address: at,
                detail: format!("left state {left:?} but the block before is {expected_left:?}"),
            });
            return Ok(false);
        }
        if right == Side::Edge || at == last_marker {
            if right != Side::Edge || at != last_marker {
                report.issues.push(Issue::MarkerMismatch {
                    address: at,
                    detail: format!("region edge at {at:#x}, expected {last_marker:#x}"),
                });
                return Ok(false);
            }
            return Ok(true);
        }

        let start = at + 1;
        let size = match right {
            Side::Allocated(width) => {
                let Some(claim) = claims.remove(&start) else {
                    report.issues.push(Issue::OrphanedBlock { address: start });
                    return Ok(false);
                };
                if claim.entry.prefix_width() != width {
                    report.issues.push(Issue::LengthMismatch {
                        address: start,
                        detail: format!(
                            "entry has a {}-byte prefix, markers say {width}",
                            claim.entry.prefix_width()
                        ),
                    });
                }
                report.allocated_blocks += 1;
                report.allocated_bytes += claim.size;
                report.payload_bytes += claim.size - claim.entry.prefix_width() as u64;
                previous_free = false;
                claim.size
            }
            free => {
                let size = match free {
                    Side::Gap => 0,
                    Side::Single => 1,
                    Side::Free(width) if start + width as u64 <= last_marker => {
                        arena.read(Address::new(start), width)?
                    }
                    _ => u64::MAX,
                };
                let fits = start.checked_add(size).is_some_and(|end| end <= last_marker);
                if !fits || Side::free(size) != free {
                    report.issues.push(Issue::LengthMismatch {
                        address: start,
                        detail: format!("free length {size} does not match marker state {free:?}"),
                    });
                    return Ok(false);
                }
                if let Side::Free(width) = free {
                    let trailing = arena.read(Address::new(start + size - width as u64), width)?;
                    if trailing != size {
                        report.issues.push(Issue::LengthMismatch {
                            address: start,
                            detail: format!("leading length {size}, trailing length {trailing}"),
                        });
                    }
                }
                if previous_free {
                    report.issues.push(Issue::UncoalescedFree { address: start });
                }
                if layout.is_listable(size) {
                    listed.insert(start, size);
                }
                report.free_blocks += 1;
                report.free_bytes += size;
                previous_free = true;
                size
            }
        };

        at = start + size;
        if at > last_marker {
            report.issues.push(Issue::LengthMismatch {
                address: start,
                detail: format!("block of {size} bytes runs past the payload region"),
            });
            return Ok(false);
        }
        expected_left = right;
    }
}

/// Matches the size-class lists against the listable free blocks of the
/// walk, removing every match from `listed`.
fn check_lists<A: Arena>(heap: &Heap<A>, listed: &mut BTreeMap<u64, u64>, report: &mut AnalysisReport) {
    let layout = heap.layout();
    for class in 0..layout.list_count() {
        let blocks = match heap.list_blocks(class) {
            Ok(blocks) => blocks,
            Err(err) => {
                report.issues.push(Issue::FreeListInconsistent {
                    class,
                    address: layout.head_address(class).as_u64(),
                    detail: err.to_string(),
                });
                continue;
            }
        };
        for (start, size) in blocks {
            let start = start.as_u64();
            if layout.class_of(size) != class {
                report.issues.push(Issue::FreeListInconsistent {
                    class,
                    address: start,
                    detail: format!("block of {size} bytes belongs to list {}", layout.class_of(size)),
                });
            }
            if !report.walk_complete {
                continue;
            }
            match listed.remove(&start) {
                Some(walked) if walked == size => {}
                Some(walked) => report.issues.push(Issue::FreeListInconsistent {
                    class,
                    address: start,
                    detail: format!("listed with {size} bytes, walk found {walked}"),
                }),
                None => report.issues.push(Issue::FreeListInconsistent {
                    class,
                    address: start,
                    detail: "listed block is not a free block on the walk".to_string(),
                }),
            }
        }
    }

    if report.walk_complete {
        for (&start, &size) in listed.iter() {
            report.issues.push(Issue::FreeListInconsistent {
                class: layout.class_of(size),
                address: start,
                detail: "free block missing from its list".to_string(),
            });
        }
    }
}

fn check_counters<A: Arena>(heap: &Heap<A>, report: &mut AnalysisReport) {
    let status = heap.status();
    let pairs = [
        ("free_bytes", status.free_bytes, report.free_bytes),
        ("free_blocks", status.free_blocks, report.free_blocks),
        ("allocated_blocks", status.allocated_blocks, report.allocated_blocks),
        ("allocated_bytes", status.allocated_bytes, report.allocated_bytes),
        ("payload_bytes", status.payload_bytes, report.payload_bytes),
        ("marker_bytes", status.marker_bytes, report.marker_bytes),
    ];
    for (counter, recorded, walked) in pairs {
        if recorded != walked {
            report.issues.push(Issue::CounterMismatch {
                counter: counter.to_string(),
                recorded,
                walked,
            });
        }
    }
}
