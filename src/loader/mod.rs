//! Ticker universe loader: a CSV of `symbol,name,exchange`.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct TickerEntry {
    pub symbol: String,
    pub name: String,
    pub exchange: String,
}

impl TickerEntry {
    /// Columns by position; short rows leave the trailing fields empty.
    fn from_record(record: &csv::StringRecord) -> Option<Self> {
        let field = |i: usize| record.get(i).unwrap_or_default().trim().to_string();
        let symbol = field(0).trim_start_matches('$').to_uppercase();
        if symbol.is_empty() {
            return None;
        }
        Some(Self {
            symbol,
            name: field(1),
            exchange: field(2),
        })
    }
}

pub fn load_universe(path: &Path) -> Result<Vec<TickerEntry>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Could not open ticker universe {:?}", path))?;
    let entries = read_universe(file);
    let mut per_exchange: BTreeMap<&str, usize> = BTreeMap::new();
    for e in &entries {
        *per_exchange.entry(e.exchange.as_str()).or_default() += 1;
    }
    info!(
        "{} symbols loaded from {:?} {:?}",
        entries.len(),
        path,
        per_exchange
    );
    Ok(entries)
}

/// Parse rows, skipping malformed ones and normalising symbols to uppercase.
pub fn read_universe<R: Read>(reader: R) -> Vec<TickerEntry> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut entries: Vec<TickerEntry> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (i, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Universe row {}: {}", i + 1, e);
                continue;
            }
        };
        let Some(entry) = TickerEntry::from_record(&record) else {
            continue;
        };
        if let Some(&first) = seen.get(&entry.symbol) {
            warn!(
                "Universe row {}: {} already listed as {:?}, skipping {:?}",
                i + 1,
                entry.symbol,
                entries[first].name,
                entry.name
            );
            continue;
        }
        seen.insert(entry.symbol.clone(), entries.len());
        entries.push(entry);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_normalised() {
        let csv = "symbol,name,exchange\n\
                   eqnr,Equinor,OSE\n\
                   $NHY , Norsk Hydro , OSE\n\
                   ,blank,OSE\n\
                   VOLV-B,Volvo\n";
        let entries = read_universe(csv.as_bytes());
        let symbols: Vec<&str> = entries.iter().map(|e| e.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["EQNR", "NHY", "VOLV-B"]);
        assert_eq!(entries[1].name, "Norsk Hydro");
        assert_eq!(entries[2].name, "Volvo");
        assert_eq!(entries[2].exchange, "");
    }

    #[test]
    fn extra_columns_are_ignored() {
        let csv = "symbol,name,exchange,sector
DNB,DNB Bank,OSE,Finance
";
        let entries = read_universe(csv.as_bytes());
        assert_eq!(
            entries,
            vec![TickerEntry {
                symbol: "DNB".into(),
                name: "DNB Bank".into(),
                exchange: "OSE".into(),
            }]
        );
    }

    #[test]
    fn repeated_symbols_keep_the_first_row() {
        let csv = "symbol,name,exchange\nTEL,Telenor,OSE\ntel,Telenor ASA,XOSL\n";
        let entries = read_universe(csv.as_bytes());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Telenor");
        assert_eq!(entries[0].exchange, "OSE");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_universe(Path::new("/nonexistent/universe.csv")).is_err());
    }
}
