//! Software TPM emulation for guests that require TPM 2.0.
//!
//! swtpm runs in the foreground and owns the terminal until interrupted;
//! the guest connects through the unix control socket below the settings
//! root.

use log::info;

use crate::deps::PackageManager;
use crate::error::{Error, Result};
use crate::host;
use crate::settings::Settings;

/// Start the emulator, installing swtpm first when it is missing.
pub fn run_emulator(settings: &Settings) -> Result<()> {
    if !host::tool_exists("swtpm", "--version") {
        info!("swtpm is not installed, installing");
        let manager = PackageManager::detect().ok_or_else(|| {
            Error::precondition("swtpm is not installed and no supported package manager was found")
        })?;
        manager.install_swtpm()?;
    }

    let state_dir = settings.tpm_dir()?;
    let socket = settings.tpm_socket_path()?;
    info!("tpm state in {}, socket at {}", state_dir.display(), socket.display());
    host::run_attached(
        "swtpm",
        &[
            "socket".to_string(),
            "--tpmstate".to_string(),
            format!("dir={}", state_dir.display()),
            "--ctrl".to_string(),
            format!("type=unixio,path={}", socket.display()),
            "--tpm2".to_string(),
            "--log".to_string(),
            "level=20".to_string(),
        ],
    )
}
