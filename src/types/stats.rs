use std::fmt;
use std::time::Duration;

//------------ Status reports ------------------------------------------------
//
// Human-readable snapshots of engine state, as produced by the `status`
// and `stat` commands. Each engine assembles its own report struct; the
// Display impls render the exact text the command channel emits.

/// Summary of a plain radix route table.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TableStatus {
    pub prefixes: u32,
    pub nexthops: u32,
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "{} prefixes, {} unique nexthops",
            self.prefixes, self.nexthops
        )
    }
}

/// Summary of a DIR-24-8 engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirStatus {
    pub prefixes: u32,
    pub nexthops: u32,
    /// Size of the primary table in bytes.
    pub direct_bytes: usize,
    /// Size of the allocated secondary blocks in bytes.
    pub secondary_bytes: usize,
    /// Number of secondary blocks in use.
    pub secondary_used: u32,
    /// Number of primary entries that resolve without a secondary access.
    pub direct_hits: u32,
    pub last_update: Duration,
}

impl fmt::Display for DirStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "DIR-24-8: {} prefixes, {} unique nexthops",
            self.prefixes, self.nexthops
        )?;
        write!(
            f,
            "Lookup tables: {} bytes direct, {} bytes secondary",
            self.direct_bytes, self.secondary_bytes
        )?;
        if self.prefixes > 0 {
            writeln!(
                f,
                " ({:.1} bytes/prefix)",
                (self.direct_bytes + self.secondary_bytes) as f64
                    / self.prefixes as f64
            )?;
        } else {
            writeln!(f)?;
        }
        writeln!(
            f,
            "Secondary table utilization: {:.1}% ({} / 32768)",
            100.0 * self.secondary_used as f64 / 32768.0,
            self.secondary_used
        )?;
        writeln!(
            f,
            "Direct table resolves {:.1}% of IPv4 address space",
            100.0 * self.direct_hits as f64 / (1 << 24) as f64
        )?;
        writeln!(
            f,
            "Last update duration: {:.1} ms",
            self.last_update.as_secs_f64() * 1000.0
        )
    }
}

/// Summary of a DXR engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct DxrStatus {
    pub prefixes: u32,
    pub nexthops: u32,
    /// Size of the direct descriptor table in bytes.
    pub direct_bytes: usize,
    /// Size of the occupied part of the range table in bytes.
    pub range_bytes: usize,
    /// Number of direct entries that resolve without a range search.
    pub direct_hits: u32,
    /// Fragment count of the largest stored chunk.
    pub max_chunk: u32,
    pub chunks_short: u32,
    pub chunks_long: u32,
    pub fragments_short: u32,
    pub fragments_long: u32,
    pub aggr_chunks_short: u32,
    pub aggr_chunks_long: u32,
    pub aggr_fragments_short: u32,
    pub aggr_fragments_long: u32,
    pub last_update: Duration,
}

impl fmt::Display for DxrStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "DXR (D20R): {} prefixes, {} unique nexthops",
            self.prefixes, self.nexthops
        )?;
        write!(
            f,
            "Lookup tables: {} bytes direct, {} bytes range",
            self.direct_bytes, self.range_bytes
        )?;
        if self.prefixes > 0 {
            writeln!(
                f,
                " ({:.1} bytes/prefix)",
                (self.direct_bytes + self.range_bytes) as f64
                    / self.prefixes as f64
            )?;
        } else {
            writeln!(f)?;
        }
        writeln!(
            f,
            "Direct table resolves {:.1}% of IPv4 address space",
            100.0 * self.direct_hits as f64 / (1 << 20) as f64
        )?;
        writeln!(
            f,
            "Longest range chunk contains {} fragments",
            self.max_chunk
        )?;
        writeln!(
            f,
            "Physical chunks: {} short, {} long",
            self.chunks_short, self.chunks_long
        )?;
        writeln!(
            f,
            "Physical fragments: {} short, {} long",
            self.fragments_short, self.fragments_long
        )?;
        writeln!(
            f,
            "Aggregated chunks: {} short, {} long",
            self.aggr_chunks_short + self.chunks_short,
            self.aggr_chunks_long + self.chunks_long
        )?;
        writeln!(
            f,
            "Aggregated fragments: {} short, {} long",
            self.aggr_fragments_short + self.fragments_short,
            self.aggr_fragments_long + self.fragments_long
        )?;
        writeln!(
            f,
            "Last update duration: {:.1} ms",
            self.last_update.as_secs_f64() * 1000.0
        )
    }
}
