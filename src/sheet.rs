use anyhow::{Context, Result, bail};
use csv::{ReaderBuilder, WriterBuilder};
use fs2::FileExt; // for file locking
use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::info;

pub type SheetRow = Vec<String>;

const DEFAULT_SHEET: &str = "Sheet1";

/// Sub-sheet (tab) selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubSheet {
    Name(String),
    /// 0-based position among the destination's sub-sheets.
    Index(usize),
}

impl From<&str> for SubSheet {
    fn from(name: &str) -> Self {
        SubSheet::Name(name.to_string())
    }
}

/// Spreadsheet-like store used as database and dashboard.
pub trait SheetSink: Send + Sync {
    /// Write `rows` at `range` (A1 notation, top-left cell anchors the block),
    /// or append after the last non-empty row when `range` is `None`. Missing
    /// destinations and named sub-sheets are created.
    fn write(
        &self,
        destination: &str,
        rows: &[SheetRow],
        subsheet: Option<&SubSheet>,
        range: Option<&str>,
    ) -> Result<()>;

    /// All rows of a sub-sheet, including any header row.
    fn read(&self, destination: &str, subsheet: Option<&SubSheet>) -> Result<Vec<SheetRow>>;
}

/// Acquire an exclusive file lock; keep the file handle alive to hold the lock.
pub fn acquire_lock(lock_path: &Path) -> Result<fs::File> {
    fs::create_dir_all(lock_path.parent().unwrap_or(Path::new("."))).ok();
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(lock_path)?;
    file.lock_exclusive()?;
    Ok(file)
}

/// Parse the top-left cell of an A1 range (`F4:G` -> row 3, col 5).
/// A missing row number means row 1.
pub fn parse_a1_start(range: &str) -> Result<(usize, usize)> {
    let cell = range.split(':').next().unwrap_or_default().trim();
    let letters: String = cell.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let digits = &cell[letters.len()..];
    if letters.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        bail!("invalid A1 range: {range}");
    }
    let col = letters
        .to_ascii_uppercase()
        .bytes()
        .try_fold(0usize, |acc, b| acc.checked_mul(26)?.checked_add(usize::from(b - b'A' + 1)))
        .with_context(|| format!("A1 column out of range: {range}"))?
        - 1;
    let row = if digits.is_empty() {
        1
    } else {
        digits.parse::<usize>().context("A1 row")?
    };
    if row == 0 {
        bail!("invalid A1 range: {range}");
    }
    Ok((row - 1, col))
}

/// Workbook stored on disk: one directory per destination, one CSV per sub-sheet.
#[derive(Debug, Clone)]
pub struct CsvWorkbook {
    root: PathBuf,
}

impl CsvWorkbook {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn destination_dir(&self, destination: &str) -> PathBuf {
        self.root.join(sanitize(destination))
    }

    fn sheet_names(dir: &Path) -> Result<Vec<String>> {
        let mut names = vec![];
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file()
                && path.extension().is_some_and(|e| e == "csv")
                && let Some(stem) = path.file_stem()
            {
                names.push(stem.to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn sheet_path(dir: &Path, subsheet: Option<&SubSheet>) -> Result<PathBuf> {
        let name = match subsheet {
            Some(SubSheet::Name(name)) => sanitize(name),
            Some(SubSheet::Index(i)) => {
                let names = Self::sheet_names(dir)?;
                match names.get(*i) {
                    Some(name) => name.clone(),
                    None => bail!("sub-sheet index {} out of range ({} sheets)", i, names.len()),
                }
            }
            None => Self::sheet_names(dir)?
                .into_iter()
                .next()
                .unwrap_or_else(|| DEFAULT_SHEET.to_string()),
        };
        Ok(dir.join(format!("{name}.csv")))
    }

    fn load_grid(path: &Path) -> Result<Vec<SheetRow>> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("open {}", path.display()))?;
        let mut grid = vec![];
        for rec in rdr.records() {
            grid.push(rec?.iter().map(str::to_string).collect());
        }
        Ok(grid)
    }

    /// write fresh file to temp, then rename
    fn save_grid(path: &Path, grid: &[SheetRow]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(path.parent().unwrap_or(Path::new(".")))?;
        {
            let mut wtr = WriterBuilder::new()
                .flexible(true)
                .from_writer(tmp.as_file_mut());
            for row in grid {
                let used = row.iter().rposition(|c| !c.is_empty()).map_or(0, |i| i + 1);
                if used == 0 {
                    wtr.write_record([""])?;
                } else {
                    wtr.write_record(&row[..used])?;
                }
            }
            wtr.flush()?;
        }
        tmp.persist(path)?;
        Ok(())
    }
}

impl SheetSink for CsvWorkbook {
    fn write(
        &self,
        destination: &str,
        rows: &[SheetRow],
        subsheet: Option<&SubSheet>,
        range: Option<&str>,
    ) -> Result<()> {
        let dir = self.destination_dir(destination);
        if !dir.exists() {
            fs::create_dir_all(&dir).context("create spreadsheet dir")?;
            info!("created new spreadsheet: {}", destination);
        }
        let _lock = acquire_lock(&dir.join(".lock"))?;
        let path = Self::sheet_path(&dir, subsheet)?;

        let mut grid = if path.exists() {
            Self::load_grid(&path)?
        } else {
            info!("created new worksheet: {} in {}", path.display(), destination);
            vec![]
        };

        match range {
            Some(range) => {
                let (row0, col0) = parse_a1_start(range)?;
                for (i, row) in rows.iter().enumerate() {
                    let r = row0 + i;
                    if grid.len() <= r {
                        grid.resize(r + 1, vec![]);
                    }
                    let target = &mut grid[r];
                    if target.len() < col0 + row.len() {
                        target.resize(col0 + row.len(), String::new());
                    }
                    target[col0..col0 + row.len()].clone_from_slice(row);
                }
                info!("wrote {} rows to {} at {}", rows.len(), path.display(), range);
            }
            None => {
                let used = grid
                    .iter()
                    .rposition(|r| r.iter().any(|c| !c.is_empty()))
                    .map_or(0, |i| i + 1);
                grid.truncate(used);
                grid.extend(rows.iter().cloned());
                info!("appended {} rows to {}", rows.len(), path.display());
            }
        }

        Self::save_grid(&path, &grid)
    }

    fn read(&self, destination: &str, subsheet: Option<&SubSheet>) -> Result<Vec<SheetRow>> {
        let dir = self.destination_dir(destination);
        if !dir.is_dir() {
            bail!("spreadsheet '{}' not found", destination);
        }
        let path = Self::sheet_path(&dir, subsheet)?;
        if !path.exists() {
            bail!("worksheet '{}' not found in '{}'", path.display(), destination);
        }
        Self::load_grid(&path)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(cells: &[&str]) -> SheetRow {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn a1_parsing() {
        assert_eq!(parse_a1_start("F4:G").unwrap(), (3, 5));
        assert_eq!(parse_a1_start("A1:F100").unwrap(), (0, 0));
        assert_eq!(parse_a1_start("AA10").unwrap(), (9, 26));
        assert_eq!(parse_a1_start("B:C").unwrap(), (0, 1));
        assert!(parse_a1_start("4F").is_err());
        assert!(parse_a1_start("A0").is_err());
        assert!(parse_a1_start(&format!("{}1:B", "Z".repeat(40))).is_err());
        assert!(parse_a1_start("A99999999999999999999999").is_err());
    }

    #[test]
    fn range_write_creates_and_places_block() {
        let dir = TempDir::new().unwrap();
        let wb = CsvWorkbook::new(dir.path());
        let sheet = SubSheet::from("Beta Table");
        wb.write("Scores", &[row(&["Coin", "Beta"]), row(&["aave", "1.2"])], Some(&sheet), Some("B2:C"))
            .unwrap();

        let grid = wb.read("Scores", Some(&sheet)).unwrap();
        assert_eq!(grid[0], row(&[""]));
        assert_eq!(grid[1], row(&["", "Coin", "Beta"]));
        assert_eq!(grid[2], row(&["", "aave", "1.2"]));
    }

    #[test]
    fn range_write_overwrites_only_its_cells() {
        let dir = TempDir::new().unwrap();
        let wb = CsvWorkbook::new(dir.path());
        let sheet = SubSheet::from("S");
        wb.write("W", &[row(&["a", "b", "c"]), row(&["d", "e", "f"])], Some(&sheet), Some("A1"))
            .unwrap();
        wb.write("W", &[row(&["X"])], Some(&sheet), Some("B2")).unwrap();

        let grid = wb.read("W", Some(&sheet)).unwrap();
        assert_eq!(grid, vec![row(&["a", "b", "c"]), row(&["d", "X", "f"])]);
    }

    #[test]
    fn append_goes_after_last_row() {
        let dir = TempDir::new().unwrap();
        let wb = CsvWorkbook::new(dir.path());
        wb.write("W", &[row(&["h1", "h2"])], None, None).unwrap();
        wb.write("W", &[row(&["1", "2"]), row(&["3", "4"])], None, None).unwrap();

        let grid = wb.read("W", None).unwrap();
        assert_eq!(grid.len(), 3);
        assert_eq!(grid[2], row(&["3", "4"]));
        assert!(dir.path().join("W").join("Sheet1.csv").exists());
    }

    #[test]
    fn index_resolves_sorted_sheet_names() {
        let dir = TempDir::new().unwrap();
        let wb = CsvWorkbook::new(dir.path());
        wb.write("W", &[row(&["b"])], Some(&SubSheet::from("Beta")), None).unwrap();
        wb.write("W", &[row(&["a"])], Some(&SubSheet::from("Alpha")), None).unwrap();

        assert_eq!(wb.read("W", Some(&SubSheet::Index(1))).unwrap(), vec![row(&["b"])]);
        assert!(wb.read("W", Some(&SubSheet::Index(2))).is_err());
    }

    #[test]
    fn reading_missing_targets_fails() {
        let dir = TempDir::new().unwrap();
        let wb = CsvWorkbook::new(dir.path());
        assert!(wb.read("nope", None).is_err());
        wb.write("W", &[row(&["x"])], Some(&SubSheet::from("A")), None).unwrap();
        assert!(wb.read("W", Some(&SubSheet::from("B"))).is_err());
    }
}
