use std::{
    fmt,
    str::{self, FromStr},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, anyhow, bail};
use sha1::{Digest, Sha1};

/// Length in bytes of a SHA-1 object id.
pub const OID_LEN: usize = 20;

/// SHA-1 identifier of a git object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; OID_LEN]);

impl ObjectId {
    /// The all-zero id git uses for "no object".
    pub const ZERO: Self = Self([0; OID_LEN]);

    /// Hash `data` as a loose object of `kind`.
    pub fn for_object(kind: ObjectKind, data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b" ");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(data);
        let digest = hasher.finalize();
        let mut raw = [0u8; OID_LEN];
        raw.copy_from_slice(&digest);
        Self(raw)
    }

    /// Build an id from a raw 20-byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; OID_LEN] = bytes
            .try_into()
            .map_err(|_| anyhow!("object id must be {OID_LEN} bytes, got {}", bytes.len()))?;
        Ok(Self(raw))
    }

    /// Raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8; OID_LEN] {
        &self.0
    }

    /// Whether this is the all-zero id.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; OID_LEN]
    }

    /// Abbreviated hex form used in user-facing messages.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl FromStr for ObjectId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).with_context(|| format!("invalid object id '{s}'"))?;
        Self::from_bytes(&bytes).with_context(|| format!("invalid object id '{s}'"))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

/// The four git object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A commit object.
    Commit,
    /// A tree (directory listing).
    Tree,
    /// File contents.
    Blob,
    /// An annotated tag.
    Tag,
}

impl ObjectKind {
    /// Name used in loose object headers.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
        }
    }

    /// Type number used in pack entry headers.
    pub fn pack_code(self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    /// Map a pack type number back to a kind, if it denotes a whole object.
    pub fn from_pack_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Commit),
            2 => Some(Self::Tree),
            3 => Some(Self::Blob),
            4 => Some(Self::Tag),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A git object: its kind, payload and the id derived from both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    /// Content-derived identifier.
    id: ObjectId,
    /// Object kind.
    kind: ObjectKind,
    /// Raw payload (without the loose-object header).
    data: Vec<u8>,
}

impl Object {
    /// Create an object, computing its id.
    pub fn new(kind: ObjectKind, data: Vec<u8>) -> Self {
        let id = ObjectId::for_object(kind, &data);
        Self { id, kind, data }
    }

    /// Convenience constructor for blobs.
    pub fn blob(data: impl Into<Vec<u8>>) -> Self {
        Self::new(ObjectKind::Blob, data.into())
    }

    /// The object's id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The object's kind.
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The object's payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// File mode of a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryMode {
    /// Regular, non-executable file.
    File,
    /// Executable file.
    Executable,
    /// Symbolic link; the blob holds the link target.
    Symlink,
    /// Submodule commit reference.
    Gitlink,
    /// Subdirectory.
    Tree,
}

impl EntryMode {
    /// Octal representation written into tree objects.
    pub fn as_octal(self) -> &'static str {
        match self {
            Self::File => "100644",
            Self::Executable => "100755",
            Self::Symlink => "120000",
            Self::Gitlink => "160000",
            Self::Tree => "40000",
        }
    }

    /// Parse the octal mode found in a tree object.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        match raw {
            b"100644" | b"100664" | b"100600" => Ok(Self::File),
            b"100755" => Ok(Self::Executable),
            b"120000" => Ok(Self::Symlink),
            b"160000" => Ok(Self::Gitlink),
            b"40000" | b"040000" => Ok(Self::Tree),
            other => bail!("unsupported tree entry mode '{}'", String::from_utf8_lossy(other)),
        }
    }

    /// Whether entries of this mode are backed by a blob.
    pub fn is_blob(self) -> bool {
        matches!(self, Self::File | Self::Executable | Self::Symlink)
    }
}

/// One entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Entry mode.
    pub mode: EntryMode,
    /// Single path segment.
    pub name: String,
    /// Id of the referenced blob, tree or commit.
    pub id: ObjectId,
}

impl TreeEntry {
    /// Key git uses to order tree entries: directories sort as if suffixed by `/`.
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.as_bytes().to_vec();
        if self.mode == EntryMode::Tree {
            key.push(b'/');
        }
        key
    }
}

/// Decode the payload of a tree object.
pub fn parse_tree(data: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let space = data[pos..]
            .iter()
            .position(|b| *b == b' ')
            .context("tree entry missing mode separator")?;
        let mode = EntryMode::parse(&data[pos..pos + space])?;
        pos += space + 1;

        let nul = data[pos..]
            .iter()
            .position(|b| *b == 0)
            .context("tree entry missing name terminator")?;
        let name = str::from_utf8(&data[pos..pos + nul])
            .context("tree entry name is not valid UTF-8")?
            .to_string();
        pos += nul + 1;

        if pos + OID_LEN > data.len() {
            bail!("tree entry '{name}' is truncated");
        }
        let id = ObjectId::from_bytes(&data[pos..pos + OID_LEN])?;
        pos += OID_LEN;
        entries.push(TreeEntry { mode, name, id });
    }
    Ok(entries)
}

/// Encode tree entries in git's canonical order.
pub fn encode_tree(entries: &[TreeEntry]) -> Vec<u8> {
    let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
    sorted.sort_by_key(|entry| entry.sort_key());

    let mut out = Vec::new();
    for entry in sorted {
        out.extend_from_slice(entry.mode.as_octal().as_bytes());
        out.push(b' ');
        out.extend_from_slice(entry.name.as_bytes());
        out.push(0);
        out.extend_from_slice(entry.id.as_bytes());
    }
    out
}

/// Author or committer line of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Display name.
    pub name: String,
    /// Email address; may be empty.
    pub email: String,
    /// Seconds since the Unix epoch.
    pub time: i64,
    /// Offset from UTC in minutes.
    pub offset_minutes: i32,
}

impl Signature {
    /// Signature stamped with the current time in UTC.
    pub fn now(name: &str, email: &str) -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            email: email.to_string(),
            time,
            offset_minutes: 0,
        }
    }

    /// Parse `Name <email> 1700000000 +0100`.
    pub fn parse(raw: &str) -> Result<Self> {
        let open = raw.find('<').context("signature missing '<'")?;
        let close = raw.rfind('>').context("signature missing '>'")?;
        if close < open {
            bail!("malformed signature '{raw}'");
        }
        let name = raw[..open].trim_end().to_string();
        let email = raw[open + 1..close].to_string();
        let mut rest = raw[close + 1..].split_whitespace();
        let time = rest
            .next()
            .context("signature missing timestamp")?
            .parse()
            .context("signature timestamp is not a number")?;
        let offset = rest.next().unwrap_or("+0000");
        Ok(Self {
            name,
            email,
            time,
            offset_minutes: parse_offset(offset)?,
        })
    }
}

/// Parse a `+hhmm` / `-hhmm` timezone offset into minutes.
fn parse_offset(raw: &str) -> Result<i32> {
    let (sign, digits) = match raw.as_bytes().first() {
        Some(b'+') => (1, &raw[1..]),
        Some(b'-') => (-1, &raw[1..]),
        _ => bail!("invalid timezone offset '{raw}'"),
    };
    if digits.len() != 4 {
        bail!("invalid timezone offset '{raw}'");
    }
    let hours: i32 = digits[..2].parse().context("invalid timezone hours")?;
    let minutes: i32 = digits[2..].parse().context("invalid timezone minutes")?;
    Ok(sign * (hours * 60 + minutes))
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.offset_minutes < 0 { '-' } else { '+' };
        let offset = self.offset_minutes.abs();
        write!(
            f,
            "{} <{}> {} {sign}{:02}{:02}",
            self.name,
            self.email,
            self.time,
            offset / 60,
            offset % 60
        )
    }
}

/// Decoded commit object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Root tree of the snapshot.
    pub tree: ObjectId,
    /// Parent commits.
    pub parents: Vec<ObjectId>,
    /// Who wrote the change.
    pub author: Signature,
    /// Who recorded the commit.
    pub committer: Signature,
    /// Commit message.
    pub message: String,
}

impl Commit {
    /// Serialize into a commit object payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("tree {}\n", self.tree);
        for parent in &self.parents {
            out.push_str(&format!("parent {parent}\n"));
        }
        out.push_str(&format!("author {}\n", self.author));
        out.push_str(&format!("committer {}\n", self.committer));
        out.push('\n');
        out.push_str(&self.message);
        if !self.message.ends_with('\n') {
            out.push('\n');
        }
        out.into_bytes()
    }

    /// Parse a commit payload. Unknown headers (e.g. `gpgsig`) are skipped.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(data);
        let (headers, message) = text
            .split_once("\n\n")
            .unwrap_or((text.as_ref(), ""));

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        for line in headers.lines() {
            if line.starts_with(' ') {
                continue;
            }
            match line.split_once(' ') {
                Some(("tree", value)) => tree = Some(value.parse()?),
                Some(("parent", value)) => parents.push(value.parse()?),
                Some(("author", value)) => author = Some(Signature::parse(value)?),
                Some(("committer", value)) => committer = Some(Signature::parse(value)?),
                _ => {}
            }
        }

        Ok(Self {
            tree: tree.context("commit has no tree header")?,
            parents,
            author: author.context("commit has no author header")?,
            committer: committer.context("commit has no committer header")?,
            message: message.to_string(),
        })
    }
}

/// The `tree` and `parent` headers of a commit payload.
///
/// Used for history walks, which must not fail on identities that a full
/// [`Commit::parse`] would reject.
pub fn commit_links(data: &[u8]) -> Result<(ObjectId, Vec<ObjectId>)> {
    let mut tree = None;
    let mut parents = Vec::new();
    for line in data.split(|b| *b == b'\n') {
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix(b"tree ") {
            tree = Some(str::from_utf8(value)?.parse()?);
        } else if let Some(value) = line.strip_prefix(b"parent ") {
            parents.push(str::from_utf8(value)?.parse()?);
        }
    }
    Ok((tree.context("commit has no tree header")?, parents))
}
