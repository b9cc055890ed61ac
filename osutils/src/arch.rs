use std::{fmt, str::FromStr};

/// CPU architectures psyopsOS is published for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemArchitecture {
    /// 64-bit x86
    X86_64,

    /// 64-bit ARM
    Aarch64,
}

impl SystemArchitecture {
    /// Get the current system architecture, if it is a supported one
    pub const fn current() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(SystemArchitecture::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(SystemArchitecture::Aarch64)
        } else {
            None
        }
    }

    /// Name used in published payload file names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
        }
    }

    /// `grub-install --target` value for UEFI systems of this architecture.
    pub fn grub_efi_target(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64-efi",
            Self::Aarch64 => "arm64-efi",
        }
    }
}

impl fmt::Display for SystemArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SystemArchitecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "x64" | "amd64" | "x86_64" => Ok(Self::X86_64),
            "arm64" | "aarch64" => Ok(Self::Aarch64),
            arch => Err(format!("unknown system architecture '{arch}'")),
        }
    }
}
