//! Reading and writing the two embedded metadata formats.
//!
//! Signatures carry a minisign trusted comment such as
//!
//! ```text
//! trusted comment: type=psyopsOS filename=psyopsOS.x86_64.20240301-120000.tar version=20240301-120000 kernel=6.6.14-0-lts alpine=3.19
//! ```
//!
//! and boot configuration files carry a single info comment such as
//!
//! ```text
//! # neuralupgrade-info: last_updated=20240301-120000 default_boot_label=psyopsOS-A extra_programs=/memtest64.efi
//! ```
//!
//! Both hold whitespace separated `key=value` tokens. Tokens without `=` are ignored.

use std::{fs, io, path::Path};

use neuralupgrade_api::{
    constants::{BOOT_INFO_COMMENT_PREFIX, TRUSTED_COMMENT_PREFIX},
    error::MetadataError,
    Metadata,
};

/// Where to read a trusted comment from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureSource<'a> {
    /// The trusted comment line itself, with or without its prefix.
    Comment(&'a str),
    /// The full contents of a minisig file.
    Contents(&'a str),
    /// Path to a minisig file.
    File(&'a Path),
}

impl<'a> SignatureSource<'a> {
    /// Picks the one source that was given. Empty strings count as not given.
    pub fn from_options(
        comment: Option<&'a str>,
        contents: Option<&'a str>,
        file: Option<&'a Path>,
    ) -> Result<Self, MetadataError> {
        let comment = comment.filter(|c| !c.is_empty());
        let contents = contents.filter(|c| !c.is_empty());
        let file = file.filter(|f| !f.as_os_str().is_empty());
        match (comment, contents, file) {
            (Some(comment), None, None) => Ok(Self::Comment(comment)),
            (None, Some(contents), None) => Ok(Self::Contents(contents)),
            (None, None, Some(file)) => Ok(Self::File(file)),
            (comment, contents, file) => Err(MetadataError::InvalidSource {
                count: [comment.is_some(), contents.is_some(), file.is_some()]
                    .into_iter()
                    .filter(|given| *given)
                    .count(),
            }),
        }
    }
}

/// Where to read a boot info comment from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootInfoSource<'a> {
    /// The comment line itself, including its prefix.
    Comment(&'a str),
    /// A boot configuration file containing the comment.
    File(&'a Path),
}

impl<'a> BootInfoSource<'a> {
    /// Picks the one source that was given. Empty strings count as not given.
    pub fn from_options(
        comment: Option<&'a str>,
        file: Option<&'a Path>,
    ) -> Result<Self, MetadataError> {
        let comment = comment.filter(|c| !c.is_empty());
        let file = file.filter(|f| !f.as_os_str().is_empty());
        match (comment, file) {
            (Some(comment), None) => Ok(Self::Comment(comment)),
            (None, Some(file)) => Ok(Self::File(file)),
            (comment, file) => Err(MetadataError::InvalidSource {
                count: usize::from(comment.is_some()) + usize::from(file.is_some()),
            }),
        }
    }
}

/// Parses the trusted comment of a minisign signature.
pub fn parse_trusted_comment(source: SignatureSource) -> Result<Metadata, MetadataError> {
    match source {
        SignatureSource::Comment(comment) => Ok(parse_pairs(
            comment
                .strip_prefix(TRUSTED_COMMENT_PREFIX)
                .unwrap_or(comment),
        )),
        SignatureSource::Contents(contents) => trusted_comment_of(contents),
        SignatureSource::File(path) => {
            let contents = read(path, |path| MetadataError::MissingSignature { path })?;
            if contents.is_empty() {
                return Err(MetadataError::EmptySignatureFile {
                    path: path.display().to_string(),
                });
            }
            trusted_comment_of(&contents)
        }
    }
}

fn trusted_comment_of(contents: &str) -> Result<Metadata, MetadataError> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix(TRUSTED_COMMENT_PREFIX))
        .map(parse_pairs)
        .ok_or(MetadataError::NoTrustedComment)
}

/// Parses the neuralupgrade info comment of a boot configuration.
pub fn parse_boot_info_comment(source: BootInfoSource) -> Result<Metadata, MetadataError> {
    match source {
        BootInfoSource::Comment(comment) => comment
            .strip_prefix(BOOT_INFO_COMMENT_PREFIX)
            .map(parse_pairs)
            .ok_or_else(|| MetadataError::InvalidBootInfoComment {
                comment: comment.into(),
            }),
        BootInfoSource::File(path) => {
            let contents = read(path, |path| MetadataError::MissingFile { path })?;
            contents
                .lines()
                .find_map(|line| line.strip_prefix(BOOT_INFO_COMMENT_PREFIX))
                .map(parse_pairs)
                .ok_or_else(|| MetadataError::MissingBootInfoComment {
                    path: path.display().to_string(),
                })
        }
    }
}

/// Renders an info comment line, without a trailing newline.
pub fn render_boot_info_comment<'a>(
    pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> String {
    let tokens = pairs
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>();
    format!("{BOOT_INFO_COMMENT_PREFIX}{}", tokens.join(" "))
}

fn parse_pairs(text: &str) -> Metadata {
    text.split_whitespace()
        .filter_map(|token| token.split_once('='))
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect()
}

fn read(
    path: &Path,
    missing: impl FnOnce(String) -> MetadataError,
) -> Result<String, MetadataError> {
    fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => missing(path.display().to_string()),
        _ => MetadataError::ReadFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use maplit::btreemap;

    use super::*;

    fn metadata(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const MINISIG: &str = indoc! {"
        untrusted comment: signature from minisign secret key
        RUQf6LRCGA9i5+7r0/Ex5UX3WhqjxB2h3aGybQ3Rj1vMh8hDv6XmYj06ZvwBFt7eUJeHlxvmGFUuUOAQ4aoLVJH0dGH0NnYgVAA=
        trusted comment: type=psyopsOS filename=psyopsOS.x86_64.20240301-120000.tar version=20240301-120000 kernel=6.6.14-0-lts alpine=3.19
        8CCbrK7+hnJUmHHEapC0jqb6wfyTmxIAiDRVZ8Ki9zzuN1aBoo4lmhGJ4jbiEJxnmvX0cybOUGa+cTkYOUpMCg==
    "};

    #[test]
    fn test_parse_trusted_comment_round_trip() {
        let parsed = parse_trusted_comment(SignatureSource::Comment(
            "trusted comment: type=T filename=F version=V kernel=K alpine=A",
        ))
        .unwrap();
        assert_eq!(
            parsed,
            btreemap! {
                "type".to_string() => "T".to_string(),
                "filename".to_string() => "F".to_string(),
                "version".to_string() => "V".to_string(),
                "kernel".to_string() => "K".to_string(),
                "alpine".to_string() => "A".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_trusted_comment_sources() {
        let expected = metadata(&[
            ("type", "psyopsOS"),
            ("filename", "psyopsOS.x86_64.20240301-120000.tar"),
            ("version", "20240301-120000"),
            ("kernel", "6.6.14-0-lts"),
            ("alpine", "3.19"),
        ]);
        assert_eq!(
            parse_trusted_comment(SignatureSource::Contents(MINISIG)).unwrap(),
            expected
        );

        let dir = tempfile::tempdir().unwrap();
        let sigfile = dir.path().join("psyopsOS.tar.minisig");
        fs::write(&sigfile, MINISIG).unwrap();
        assert_eq!(
            parse_trusted_comment(SignatureSource::File(&sigfile)).unwrap(),
            expected
        );
    }

    #[test]
    fn test_parse_trusted_comment_drops_malformed_tokens() {
        assert_eq!(
            parse_trusted_comment(SignatureSource::Comment(
                "trusted comment: this is not a key-value pair"
            ))
            .unwrap(),
            Metadata::new()
        );
        assert_eq!(
            parse_trusted_comment(SignatureSource::Comment(
                "type=psyopsOS garbage version=1=2"
            ))
            .unwrap(),
            metadata(&[("type", "psyopsOS"), ("version", "1=2")])
        );
    }

    #[test]
    fn test_parse_trusted_comment_errors() {
        let unsigned = "untrusted comment: nothing to see\nRUQf6LRCGA9i5\n";
        assert_eq!(
            parse_trusted_comment(SignatureSource::Contents(unsigned)),
            Err(MetadataError::NoTrustedComment)
        );

        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.minisig");
        fs::write(&empty, "").unwrap();
        assert!(matches!(
            parse_trusted_comment(SignatureSource::File(&empty)),
            Err(MetadataError::EmptySignatureFile { .. })
        ));

        let missing = dir.path().join("missing.minisig");
        assert_eq!(
            parse_trusted_comment(SignatureSource::File(&missing)),
            Err(MetadataError::MissingSignature {
                path: missing.display().to_string()
            })
        );
    }

    #[test]
    fn test_signature_source_requires_exactly_one() {
        assert_eq!(
            SignatureSource::from_options(None, None, None),
            Err(MetadataError::InvalidSource { count: 0 })
        );
        assert_eq!(
            SignatureSource::from_options(Some("x=y"), Some(MINISIG), None),
            Err(MetadataError::InvalidSource { count: 2 })
        );
        assert_eq!(
            SignatureSource::from_options(Some("x=y"), Some(MINISIG), Some(Path::new("/a"))),
            Err(MetadataError::InvalidSource { count: 3 })
        );
        assert_eq!(
            SignatureSource::from_options(Some(""), Some(MINISIG), None),
            Ok(SignatureSource::Contents(MINISIG))
        );
        assert_eq!(
            SignatureSource::from_options(None, None, Some(Path::new("/a.minisig"))),
            Ok(SignatureSource::File(Path::new("/a.minisig")))
        );

        assert_eq!(
            BootInfoSource::from_options(None, None),
            Err(MetadataError::InvalidSource { count: 0 })
        );
        assert_eq!(
            BootInfoSource::from_options(Some("# neuralupgrade-info: "), Some(Path::new("/x"))),
            Err(MetadataError::InvalidSource { count: 2 })
        );
    }

    #[test]
    fn test_parse_boot_info_comment() {
        let comment = render_boot_info_comment([
            ("last_updated", "20240301-120000"),
            ("default_boot_label", "psyopsOS-B"),
            ("extra_programs", "/memtest64.efi,/tcshell.efi"),
        ]);
        assert_eq!(
            comment,
            "# neuralupgrade-info: last_updated=20240301-120000 default_boot_label=psyopsOS-B \
            extra_programs=/memtest64.efi,/tcshell.efi"
        );
        let expected = metadata(&[
            ("last_updated", "20240301-120000"),
            ("default_boot_label", "psyopsOS-B"),
            ("extra_programs", "/memtest64.efi,/tcshell.efi"),
        ]);
        assert_eq!(
            parse_boot_info_comment(BootInfoSource::Comment(&comment)).unwrap(),
            expected
        );

        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("grub.cfg");
        fs::write(
            &config,
            format!("set timeout=5\n#### comment\n{comment}\n####\nmenuentry \"x\" {{\n}}\n"),
        )
        .unwrap();
        assert_eq!(
            parse_boot_info_comment(BootInfoSource::File(&config)).unwrap(),
            expected
        );
    }

    #[test]
    fn test_parse_boot_info_comment_errors() {
        assert!(matches!(
            parse_boot_info_comment(BootInfoSource::Comment("# other: a=b")),
            Err(MetadataError::InvalidBootInfoComment { .. })
        ));

        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("grub.cfg");
        assert!(matches!(
            parse_boot_info_comment(BootInfoSource::File(&config)),
            Err(MetadataError::MissingFile { .. })
        ));

        fs::write(&config, "set timeout=5\n").unwrap();
        assert!(matches!(
            parse_boot_info_comment(BootInfoSource::File(&config)),
            Err(MetadataError::MissingBootInfoComment { .. })
        ));
    }
}
