//! Saving policy, scan numbering and the data writers.
//!
//! A [`ScanSaving`] object describes where a scan's data goes: session and
//! user names, destination path and filename template, scan-number
//! formatting and the live-storage retention. Each scan clones the policy
//! at construction so later changes do not affect a running scan.
//!
//! Scan numbers are allocated exactly once per scan, strictly inside the
//! saving scope of `Scan::run`, under [`SCAN_NUMBER_LOCK`]: one
//! process-wide lock shared by all scans, so numbering is globally
//! serialized. Unsaved scans draw from a separate shadow counter.
//!
//! Writers implement [`ScanWriter`]. Saved scans use the CSV writer (with
//! the `storage_csv` feature, enabled by default); unsaved scans get a
//! [`NullWriter`].

use crate::config::SavingSettings;
use crate::error::{ScanError, ScanResult};
use crate::metadata::ScanInfo;
use crate::store::DataStore;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Process-wide lock serializing scan-number allocation across all scans.
pub static SCAN_NUMBER_LOCK: Lazy<tokio::sync::Mutex<()>> =
    Lazy::new(|| tokio::sync::Mutex::new(()));

/// Counter field used for saved scans.
pub const SCAN_NUMBER_KEY: &str = "last_scan_number";
/// Counter field used for unsaved ("shadow") scans.
pub const SHADOW_SCAN_NUMBER_KEY: &str = "last_shadow_scan_number";

/// Describes how a scan is saved and numbered.
#[derive(Clone, Debug)]
pub struct ScanSaving {
    pub session: String,
    pub user_name: String,
    pub base_path: PathBuf,
    /// File name; `{session}`, `{scan_name}` and `{scan_number}` are
    /// substituted. Without a `{scan_number}` placeholder the destination
    /// is final and numbering continues from its existing content.
    pub data_filename: String,
    pub scan_number_width: usize,
    pub data_policy: String,
    pub expiration: Duration,
}

impl Default for ScanSaving {
    fn default() -> Self {
        Self::from_settings(&SavingSettings::default())
    }
}

impl ScanSaving {
    pub fn from_settings(settings: &SavingSettings) -> Self {
        Self {
            session: settings.session.clone(),
            user_name: settings.user_name.clone(),
            base_path: settings.base_path.clone(),
            data_filename: settings.data_filename.clone(),
            scan_number_width: settings.scan_number_width,
            data_policy: settings.data_policy.clone(),
            expiration: settings.expiration,
        }
    }

    /// Root key under which all of this session's nodes live; also the
    /// parent identifier of the numbering store.
    pub fn root_key(&self) -> String {
        self.session.clone()
    }

    pub fn format_scan_number(&self, number: u64) -> String {
        format!("{number:0width$}", width = self.scan_number_width)
    }

    /// Whether the destination filename is independent of the scan number.
    pub fn filename_is_final(&self) -> bool {
        !self.data_filename.contains("{scan_number}")
    }

    /// Notification that a scan starts running under this policy.
    pub fn on_scan_run(&self, saved: bool) {
        log::debug!(
            "session '{}': scan running (saved={saved}, path={})",
            self.session,
            self.base_path.display()
        );
    }

    /// Apply the retention policy to a finished scan's keys.
    pub fn set_expiration_time(
        &self,
        store: &Arc<dyn DataStore>,
        data_keys: &[String],
        parent_keys: &[String],
    ) -> ScanResult<()> {
        store.set_ttl(data_keys, self.expiration)?;
        // Parents live ten times longer so the tree stays browsable after
        // the bulk data is gone.
        store.set_ttl(parent_keys, self.expiration * 10)
    }

    /// Create the writer for one scan.
    pub fn create_writer(&self, scan_name: &str, save: bool, save_images: bool) -> Box<dyn ScanWriter> {
        if save {
            #[cfg(feature = "storage_csv")]
            {
                let mut writer = CsvWriter::new(self, scan_name);
                writer.set_save_images(save_images);
                return Box::new(writer);
            }
            #[cfg(not(feature = "storage_csv"))]
            {
                log::warn!("no storage backend enabled, scan will not be saved");
            }
        }
        let _ = save_images;
        Box::new(NullWriter::new(self.base_path.clone()))
    }
}

/// Writer backend invoked at well-defined scan lifecycle points.
#[async_trait]
pub trait ScanWriter: Send + Sync {
    /// Destination file, with placeholders until the scan number is known.
    fn filename(&self) -> PathBuf;

    /// Record the allocated scan number; resolves the filename template.
    fn set_scan_number(&mut self, number: u64, formatted: &str);

    /// Highest scan number already present in the destination, 0 when the
    /// destination does not exist yet.
    fn last_scan_number(&self) -> ScanResult<u64>;

    fn save_images(&self) -> bool {
        false
    }

    async fn prepare(&mut self, scan_info: &ScanInfo) -> ScanResult<()>;

    /// Persist the finished scan entry (metadata plus a data snapshot).
    async fn finalize(
        &mut self,
        scan_info: &ScanInfo,
        data: &BTreeMap<String, Vec<f64>>,
    ) -> ScanResult<()>;

    async fn close(&mut self) -> ScanResult<()>;

    /// Durable read-back of one channel, used once live storage expired.
    fn read_channel(&self, channel: &str) -> ScanResult<Vec<f64>>;
}

/// Writer used for unsaved scans; accepts everything, stores nothing.
pub struct NullWriter {
    base_path: PathBuf,
}

impl NullWriter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }
}

#[async_trait]
impl ScanWriter for NullWriter {
    fn filename(&self) -> PathBuf {
        self.base_path.join("<not saved>")
    }

    fn set_scan_number(&mut self, _number: u64, _formatted: &str) {}

    fn last_scan_number(&self) -> ScanResult<u64> {
        Ok(0)
    }

    async fn prepare(&mut self, _scan_info: &ScanInfo) -> ScanResult<()> {
        Ok(())
    }

    async fn finalize(
        &mut self,
        _scan_info: &ScanInfo,
        _data: &BTreeMap<String, Vec<f64>>,
    ) -> ScanResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> ScanResult<()> {
        Ok(())
    }

    fn read_channel(&self, _channel: &str) -> ScanResult<Vec<f64>> {
        Err(ScanError::Writer(
            "scan was not saved, no durable copy exists".into(),
        ))
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_writer::CsvWriter;

#[cfg(feature = "storage_csv")]
mod csv_writer {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::io::{BufRead, BufReader, Write};

    /// CSV-backed scan writer.
    ///
    /// Each finished scan appends one section to the destination file: a
    /// `# scan <number> <metadata json>` comment line followed by
    /// `scan,channel,index,value` rows. A final (un-numbered) destination
    /// accumulates sections, which is also what scan numbering reads back.
    pub struct CsvWriter {
        base_path: PathBuf,
        template: String,
        scan_number: Option<u64>,
        resolved: Option<PathBuf>,
        save_images: bool,
    }

    impl CsvWriter {
        pub fn new(saving: &ScanSaving, scan_name: &str) -> Self {
            let template = saving
                .data_filename
                .replace("{session}", &saving.session)
                .replace("{scan_name}", scan_name);
            Self {
                base_path: saving.base_path.clone(),
                template,
                scan_number: None,
                resolved: None,
                save_images: false,
            }
        }

        pub fn set_save_images(&mut self, save_images: bool) {
            self.save_images = save_images;
        }

        fn path_for(&self, name: &str) -> PathBuf {
            self.base_path.join(name)
        }
    }

    #[async_trait]
    impl ScanWriter for CsvWriter {
        fn filename(&self) -> PathBuf {
            match &self.resolved {
                Some(path) => path.clone(),
                None => self.path_for(&self.template),
            }
        }

        fn set_scan_number(&mut self, number: u64, formatted: &str) {
            self.scan_number = Some(number);
            let name = self.template.replace("{scan_number}", formatted);
            self.resolved = Some(self.path_for(&name));
        }

        fn last_scan_number(&self) -> ScanResult<u64> {
            let path = self.filename();
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                Err(err) => return Err(err.into()),
            };
            let mut last = 0;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if let Some(rest) = line.strip_prefix("# scan ") {
                    if let Some(number) = rest
                        .split_whitespace()
                        .next()
                        .and_then(|n| n.parse::<u64>().ok())
                    {
                        last = last.max(number);
                    }
                }
            }
            Ok(last)
        }

        fn save_images(&self) -> bool {
            self.save_images
        }

        async fn prepare(&mut self, _scan_info: &ScanInfo) -> ScanResult<()> {
            std::fs::create_dir_all(&self.base_path)?;
            Ok(())
        }

        async fn finalize(
            &mut self,
            scan_info: &ScanInfo,
            data: &BTreeMap<String, Vec<f64>>,
        ) -> ScanResult<()> {
            let number = self
                .scan_number
                .ok_or_else(|| ScanError::Writer("scan number not set".into()))?;
            std::fs::create_dir_all(&self.base_path)?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.filename())?;

            let metadata = serde_json::Value::Object(scan_info.snapshot());
            writeln!(file, "# scan {number} {metadata}")?;

            let mut writer = csv::Writer::from_writer(file);
            writer
                .write_record(["scan", "channel", "index", "value"])
                .map_err(|err| ScanError::Writer(err.to_string()))?;
            for (channel, values) in data {
                for (index, value) in values.iter().enumerate() {
                    writer
                        .write_record(&[
                            number.to_string(),
                            channel.clone(),
                            index.to_string(),
                            value.to_string(),
                        ])
                        .map_err(|err| ScanError::Writer(err.to_string()))?;
                }
            }
            writer
                .flush()
                .map_err(|err| ScanError::Writer(err.to_string()))?;
            log::info!(
                "scan {number} written to '{}'",
                self.filename().display()
            );
            Ok(())
        }

        async fn close(&mut self) -> ScanResult<()> {
            Ok(())
        }

        fn read_channel(&self, channel: &str) -> ScanResult<Vec<f64>> {
            let number = self
                .scan_number
                .ok_or_else(|| ScanError::Writer("scan number not set".into()))?;
            let file = File::open(self.filename())?;
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .comment(Some(b'#'))
                .from_reader(file);

            let wanted = number.to_string();
            let mut values = Vec::new();
            for record in reader.records() {
                let record = record.map_err(|err| ScanError::Writer(err.to_string()))?;
                if record.get(0) == Some(wanted.as_str()) && record.get(1) == Some(channel) {
                    if let Some(value) = record.get(3).and_then(|v| v.parse::<f64>().ok()) {
                        values.push(value);
                    }
                }
            }
            Ok(values)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_number_formatting() {
        let saving = ScanSaving {
            scan_number_width: 4,
            ..ScanSaving::default()
        };
        assert_eq!(saving.format_scan_number(7), "0007");
        assert_eq!(saving.format_scan_number(12345), "12345");
    }

    #[test]
    fn test_filename_finality() {
        let mut saving = ScanSaving::default();
        assert!(!saving.filename_is_final());
        saving.data_filename = "all_scans.csv".to_string();
        assert!(saving.filename_is_final());
    }

    #[tokio::test]
    async fn test_null_writer_has_no_durable_copy() {
        let writer = NullWriter::new(PathBuf::from("/tmp"));
        assert_eq!(writer.last_scan_number().expect("never fails"), 0);
        assert!(writer.read_channel("diode:intensity").is_err());
    }

    #[cfg(feature = "storage_csv")]
    mod csv {
        use super::*;
        use crate::metadata::ScanInfo;
        use std::path::Path;

        fn saving_in(dir: &Path, filename: &str) -> ScanSaving {
            ScanSaving {
                base_path: dir.to_path_buf(),
                data_filename: filename.to_string(),
                ..ScanSaving::default()
            }
        }

        #[tokio::test]
        async fn test_finalize_then_read_back() {
            let dir = tempfile::tempdir().expect("tempdir");
            let saving = saving_in(dir.path(), "scan_{scan_number}.csv");
            let mut writer = CsvWriter::new(&saving, "a_scan");
            writer.set_scan_number(3, &saving.format_scan_number(3));

            let info = ScanInfo::new();
            info.set("title", "a_scan");
            writer.prepare(&info).await.expect("prepare");

            let mut data = BTreeMap::new();
            data.insert("diode:intensity".to_string(), vec![1.0, 2.5, -3.0]);
            writer.finalize(&info, &data).await.expect("finalize");
            writer.close().await.expect("close");

            assert_eq!(
                writer.read_channel("diode:intensity").expect("read back"),
                vec![1.0, 2.5, -3.0]
            );
            assert!(writer
                .read_channel("missing")
                .expect("unknown channel reads empty")
                .is_empty());
        }

        #[tokio::test]
        async fn test_last_scan_number_from_final_destination() {
            let dir = tempfile::tempdir().expect("tempdir");
            let saving = saving_in(dir.path(), "all_scans.csv");

            let mut first = CsvWriter::new(&saving, "a_scan");
            first.set_scan_number(1, "0001");
            first
                .finalize(&ScanInfo::new(), &BTreeMap::new())
                .await
                .expect("finalize");

            let mut second = CsvWriter::new(&saving, "a_scan");
            second.set_scan_number(2, "0002");
            second
                .finalize(&ScanInfo::new(), &BTreeMap::new())
                .await
                .expect("finalize");

            let probe = CsvWriter::new(&saving, "a_scan");
            assert_eq!(probe.last_scan_number().expect("derive"), 2);
        }
    }
}
