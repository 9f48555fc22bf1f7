use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".pilotdeck"))
            .unwrap_or_else(|| PathBuf::from(".pilotdeck"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// Root for browser profiles launched by the browser router.
    pub fn browser_dir(&self) -> PathBuf {
        self.base.join("browser")
    }

    pub fn browser_profile_dir(&self, session: &str) -> PathBuf {
        let safe = session.replace([':', '/', '\\'], "_");
        self.browser_dir().join("profiles").join(safe)
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
