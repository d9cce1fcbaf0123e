//! Text-level SAM header operations.
//!
//! The output header differs from the input only by one appended `@PG`
//! line, so all manipulation happens on the header text itself; nothing is
//! re-serialized through a structured header model. The same text also
//! yields the read-group → library table used for duplicate accounting.

use std::collections::HashMap;

fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.split('\t').skip(1).find_map(|f| f.strip_prefix(key).and_then(|v| v.strip_prefix(':')))
}

/// Read-group and library lookup built from `@RG` header lines.
///
/// Read groups are numbered in order of appearance. Distinct `LB` values
/// are numbered from 1 in order of appearance; id 0 is the default library
/// for records without a resolvable `LB`.
pub struct LibraryTable {
    read_groups: HashMap<Vec<u8>, (i32, u32)>,
    library_names: Vec<String>,
}

/// Name reported for the default library (id 0).
pub const DEFAULT_LIBRARY_NAME: &str = "unknown";

impl LibraryTable {
    /// Parses `@RG` lines out of the header text.
    #[must_use]
    pub fn from_header_text(text: &str) -> Self {
        let mut read_groups = HashMap::new();
        let mut library_names = vec![DEFAULT_LIBRARY_NAME.to_string()];
        let mut library_ids: HashMap<String, u32> = HashMap::new();

        let mut rg_index: i32 = 0;
        for line in text.lines() {
            if !line.starts_with("@RG") {
                continue;
            }
            let Some(id) = field(line, "ID") else { continue };
            let lib_id = match field(line, "LB") {
                Some(lb) => *library_ids.entry(lb.to_string()).or_insert_with(|| {
                    library_names.push(lb.to_string());
                    #[allow(clippy::cast_possible_truncation)]
                    let new_id = (library_names.len() - 1) as u32;
                    new_id
                }),
                None => 0,
            };
            read_groups.insert(id.as_bytes().to_vec(), (rg_index, lib_id));
            rg_index += 1;
        }

        Self { read_groups, library_names }
    }

    /// Resolves a record's RG tag to (read-group index, library id).
    ///
    /// Missing or unknown read groups resolve to (-1, 0).
    #[must_use]
    pub fn resolve(&self, read_group: Option<&[u8]>) -> (i32, u32) {
        read_group.and_then(|rg| self.read_groups.get(rg).copied()).unwrap_or((-1, 0))
    }

    /// The name of a library id.
    #[must_use]
    pub fn library_name(&self, lib_id: u32) -> &str {
        self.library_names.get(lib_id as usize).map_or(DEFAULT_LIBRARY_NAME, String::as_str)
    }

    /// Number of named libraries (excluding the default slot).
    #[must_use]
    pub fn library_count(&self) -> usize {
        self.library_names.len() - 1
    }
}

/// Finds the id of the last program in the `@PG` chain: the one no other
/// program references through `PP`.
#[must_use]
pub fn last_program_id(text: &str) -> Option<String> {
    let pg_lines: Vec<&str> = text.lines().filter(|l| l.starts_with("@PG")).collect();
    if pg_lines.is_empty() {
        return None;
    }

    let referenced: Vec<&str> = pg_lines.iter().filter_map(|l| field(l, "PP")).collect();
    for line in &pg_lines {
        if let Some(id) = field(line, "ID") {
            if !referenced.contains(&id) {
                return Some(id.to_string());
            }
        }
    }
    // A cyclic chain is invalid; fall back to the final line's id.
    pg_lines.last().and_then(|l| field(l, "ID")).map(String::from)
}

/// Produces a program id not yet present in the header, suffixing `.1`,
/// `.2`, … on collision.
#[must_use]
pub fn unique_program_id(text: &str, base: &str) -> String {
    let existing: Vec<&str> =
        text.lines().filter(|l| l.starts_with("@PG")).filter_map(|l| field(l, "ID")).collect();
    if !existing.contains(&base) {
        return base.to_string();
    }
    let mut i = 1;
    loop {
        let candidate = format!("{base}.{i}");
        if !existing.contains(&candidate.as_str()) {
            return candidate;
        }
        i += 1;
    }
}

/// Appends a `@PG` line with PP chaining to the header text.
#[must_use]
pub fn add_program_line(text: &str, name: &str, version: &str, command_line: &str) -> String {
    let id = unique_program_id(text, name);
    let previous = last_program_id(text);

    let mut line = format!("@PG\tID:{id}\tPN:{name}");
    if let Some(pp) = previous {
        line.push_str(&format!("\tPP:{pp}"));
    }
    line.push_str(&format!("\tCL:{command_line}\tVN:{version}"));

    let mut out = text.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&line);
    out.push('\n');
    out
}
