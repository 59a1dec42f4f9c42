/// Names in a policy directory that are never loaded
///
/// Packaging and editor leftovers sit next to real policy files. Debian
/// transitional files are skipped quietly; the rest are worth a warning.

/// Verdict for a directory entry name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blacklisted {
    /// Load the file
    No,
    /// Skip without comment
    Silent,
    /// Skip, but let the operator know
    Reported,
}

impl Blacklisted {
    pub fn is_skipped(self) -> bool {
        self != Blacklisted::No
    }
}

const IGNORED_SUFFIXES: &[(&str, bool)] = &[
    (".dpkg-new", true),
    (".dpkg-old", true),
    (".dpkg-dist", true),
    (".dpkg-bak", true),
    (".rpmnew", false),
    (".rpmsave", false),
    (".orig", false),
    (".rej", false),
    ("~", false),
];

/// Classify a single directory entry name.
pub fn classify(name: &str) -> Blacklisted {
    if name.is_empty() || name.starts_with('.') || name == "README" {
        return Blacklisted::Silent;
    }

    for (suffix, silent) in IGNORED_SUFFIXES {
        if name.ends_with(suffix) {
            return if *silent {
                Blacklisted::Silent
            } else {
                Blacklisted::Reported
            };
        }
    }

    Blacklisted::No
}

/// True when `name` must not be loaded; reported names are logged.
pub fn is_blacklisted(name: &str) -> bool {
    let verdict = classify(name);
    if verdict == Blacklisted::Reported {
        log::warn!("Skipping backup or packaging file '{}'", name);
    }
    verdict.is_skipped()
}
