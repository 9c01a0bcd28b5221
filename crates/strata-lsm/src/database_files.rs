use std::path::{Path, PathBuf};

use crate::{config::TierPolicy, format::FileNumber};


/// The files the engine keeps under a tier root.
#[derive(Debug, Clone, Copy)]
pub(crate) enum DbFileName {
    Log {
        file_number: FileNumber,
    },
    Lockfile,
    Table {
        file_number: FileNumber,
    },
    Manifest {
        file_number: FileNumber,
    },
    Current,
    Temp {
        file_number: FileNumber,
    },
    InfoLog,
    OldInfoLog,
}

impl DbFileName {
    #[must_use]
    pub fn parse(file_name: &Path) -> Option<Self> {
        // All valid file names are 7-bit ASCII and thus valid UTF-8.
        let file_name = file_name.to_str()?;

        // Note that all the valid file names are nonempty
        let &first_byte = file_name.as_bytes().first()?;
        // `from_str_radix` permits a leading sign, including `+`. We need to reject this case.
        if first_byte == b'+' {
            return None;
        }

        if let Some(file_number) = file_name.strip_suffix(".ldb") {
            let file_number = FileNumber(u64::from_str_radix(file_number, 10).ok()?);
            Some(Self::Table { file_number })

        } else if let Some(file_number) = file_name.strip_suffix(".log") {
            let file_number = FileNumber(u64::from_str_radix(file_number, 10).ok()?);
            Some(Self::Log { file_number })

        } else if let Some(file_number) = file_name.strip_suffix(".dbtmp") {
            let file_number = FileNumber(u64::from_str_radix(file_number, 10).ok()?);
            Some(Self::Temp { file_number })

        } else if let Some(file_number) = file_name.strip_prefix("MANIFEST-") {
            let &first_num_byte = file_number.as_bytes().first()?;
            if first_num_byte == b'+' {
                return None;
            }

            let file_number = FileNumber(u64::from_str_radix(file_number, 10).ok()?);
            Some(Self::Manifest { file_number })

        } else {
            Some(match file_name {
                "LOCK"    => Self::Lockfile,
                "CURRENT" => Self::Current,
                "LOG"     => Self::InfoLog,
                "LOG.old" => Self::OldInfoLog,
                _         => return None,
            })
        }
    }

    #[must_use]
    pub fn file_name(self) -> PathBuf {
        match self {
            Self::Log { file_number }      => format!("{:06}.log", file_number.0).into(),
            Self::Lockfile                 => Path::new("LOCK").to_owned(),
            Self::Table { file_number }    => format!("{:06}.ldb", file_number.0).into(),
            Self::Manifest { file_number } => format!("MANIFEST-{:06}", file_number.0).into(),
            Self::Current                  => Path::new("CURRENT").to_owned(),
            Self::Temp { file_number }     => format!("{:06}.dbtmp", file_number.0).into(),
            Self::InfoLog                  => Path::new("LOG").to_owned(),
            Self::OldInfoLog               => Path::new("LOG.old").to_owned(),
        }
    }
}

/// The two tier roots, plus the placement rules for non-table files.
///
/// Table files always carry the same name under either root, so cross-tier copies are pure
/// directory swaps. Manifests, `CURRENT` and info logs follow `meta_on_primary`; write-ahead
/// logs follow `log_on_primary`.
#[derive(Debug, Clone)]
pub(crate) struct TierPaths {
    primary:         PathBuf,
    secondary:       Option<PathBuf>,
    meta_on_primary: bool,
    log_on_primary:  bool,
}

impl TierPaths {
    #[must_use]
    pub fn new(primary: PathBuf, secondary: Option<PathBuf>, policy: &TierPolicy) -> Self {
        let no_secondary = secondary.is_none();
        Self {
            primary,
            secondary,
            meta_on_primary: policy.meta_on_primary || no_secondary,
            log_on_primary:  policy.log_on_primary || no_secondary,
        }
    }

    #[inline]
    #[must_use]
    pub fn primary_root(&self) -> &Path {
        &self.primary
    }

    #[inline]
    #[must_use]
    pub fn secondary_root(&self) -> Option<&Path> {
        self.secondary.as_deref()
    }

    /// The root holding `CURRENT`, manifests and info logs.
    #[must_use]
    pub fn meta_root(&self) -> &Path {
        if self.meta_on_primary {
            &self.primary
        } else {
            self.secondary.as_deref().unwrap_or(&self.primary)
        }
    }

    /// The root holding write-ahead log segments.
    #[must_use]
    pub fn log_root(&self) -> &Path {
        if self.log_on_primary {
            &self.primary
        } else {
            self.secondary.as_deref().unwrap_or(&self.primary)
        }
    }

    #[must_use]
    pub fn table_path(&self, file_number: FileNumber) -> PathBuf {
        self.primary.join(DbFileName::Table { file_number }.file_name())
    }

    #[must_use]
    pub fn secondary_table_path(&self, file_number: FileNumber) -> Option<PathBuf> {
        self.secondary
            .as_deref()
            .map(|root| root.join(DbFileName::Table { file_number }.file_name()))
    }

    #[must_use]
    pub fn manifest_path(&self, file_number: FileNumber) -> PathBuf {
        self.meta_root().join(DbFileName::Manifest { file_number }.file_name())
    }

    #[must_use]
    pub fn current_path(&self) -> PathBuf {
        self.meta_root().join(DbFileName::Current.file_name())
    }

    #[must_use]
    pub fn temp_path(&self, file_number: FileNumber) -> PathBuf {
        self.meta_root().join(DbFileName::Temp { file_number }.file_name())
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.primary.join(DbFileName::Lockfile.file_name())
    }
}


#[cfg(test)]
mod tests {
    use crate::config::{DbMode, EngineOptions};

    use super::*;


    /// Tests that the filenames do not have directory components.
    #[test]
    fn file_name_has_no_slash() {
        for file_number in (0..10).map(FileNumber) {
            for file_name in [
                DbFileName::Log { file_number },
                DbFileName::Table { file_number },
                DbFileName::Manifest { file_number },
                DbFileName::Temp { file_number },
            ].map(DbFileName::file_name) {
                assert_eq!(file_name.file_name(), Some(file_name.as_os_str()));
            }
        }

        for file_name in [
            DbFileName::Lockfile,
            DbFileName::Current,
            DbFileName::InfoLog,
            DbFileName::OldInfoLog,
        ].map(DbFileName::file_name) {
            assert_eq!(file_name.file_name(), Some(file_name.as_os_str()));
        }
    }

    #[test]
    fn parse_round_trip() {
        for name in ["000007.ldb", "000007.log", "MANIFEST-000012", "CURRENT", "LOCK"] {
            let parsed = DbFileName::parse(Path::new(name)).unwrap();
            assert_eq!(parsed.file_name(), Path::new(name).to_owned());
        }

        assert!(DbFileName::parse(Path::new("+7.ldb")).is_none());
        assert!(DbFileName::parse(Path::new("MANIFEST-")).is_none());
        assert!(DbFileName::parse(Path::new("unrelated.txt")).is_none());
    }

    #[test]
    fn hybrid_meta_lives_on_secondary() {
        let options = EngineOptions::new(DbMode::HLsm, "/pri").with_secondary("/sec");
        let policy = crate::config::TierPolicy::from_options(&options);
        let paths = TierPaths::new(
            options.primary_path.clone(),
            options.secondary_path.clone(),
            &policy,
        );

        assert_eq!(paths.meta_root(), Path::new("/sec"));
        assert_eq!(paths.table_path(FileNumber(3)), Path::new("/pri/000003.ldb"));
        assert_eq!(
            paths.secondary_table_path(FileNumber(3)).unwrap(),
            Path::new("/sec/000003.ldb"),
        );
    }
}
