//! Client side of git's v0 smart protocol (`git-upload-pack` and
//! `git-receive-pack`), independent of the byte transport underneath.

use std::str;

use anyhow::{Context, Result, bail};

use crate::{
    object::{Object, ObjectId},
    pack::{parse_pack, write_pack},
    pktline::{FLUSH, PktLine, PktReader, push_data, trim_newline},
    remote::{Fetched, RefUpdate, RemoteError, RemoteResult},
};

/// Agent string sent to servers.
const AGENT: &str = concat!("agent=memgit/", env!("CARGO_PKG_VERSION"));

/// Ref name used by servers to advertise capabilities of an empty repository.
const NO_REFS: &str = "capabilities^{}";

/// Service running at the other end of an [`Exchange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// `git-upload-pack`, for fetching.
    UploadPack,
    /// `git-receive-pack`, for pushing.
    ReceivePack,
}

impl Service {
    /// Command name as invoked on the server.
    pub fn command(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }
}

/// A single request/response conversation with a git service.
///
/// The server speaks first (the ref advertisement), then the client sends one
/// request and reads the response until the server closes the stream.
pub trait Exchange {
    /// Read the ref advertisement, up to and including its flush packet.
    fn advertisement(&mut self) -> Result<Vec<u8>>;

    /// Send `request`, close our side, and read everything the server sends back.
    fn finish(&mut self, request: &[u8]) -> Result<Vec<u8>>;
}

/// Refs and capabilities advertised by a server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// `(refname, id)` pairs in advertised order; peeled tags are skipped.
    refs: Vec<(String, ObjectId)>,
    /// Capability tokens from the first line.
    capabilities: Vec<String>,
}

impl Advertisement {
    /// Parse a v0 ref advertisement.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = PktReader::new(data);
        let mut advertisement = Self::default();
        let mut first = true;
        for line in reader.read_section()? {
            let line = trim_newline(&line);
            if let Some(message) = line.strip_prefix(b"ERR ") {
                bail!("server error: {}", String::from_utf8_lossy(message));
            }
            if line.starts_with(b"version ") {
                continue;
            }
            let (refpart, caps) = match line.iter().position(|b| *b == 0) {
                Some(nul) => (&line[..nul], Some(&line[nul + 1..])),
                None => (line, None),
            };
            if first {
                if let Some(caps) = caps {
                    advertisement.capabilities = String::from_utf8_lossy(caps)
                        .split_whitespace()
                        .map(String::from)
                        .collect();
                }
                first = false;
            }
            let text = str::from_utf8(refpart).context("ref line is not UTF-8")?;
            let (id, name) = text
                .split_once(' ')
                .with_context(|| format!("malformed ref line '{text}'"))?;
            if name == NO_REFS || name.ends_with("^{}") {
                continue;
            }
            advertisement.refs.push((name.to_string(), id.parse()?));
        }
        Ok(advertisement)
    }

    /// Current value of `refname`.
    pub fn get(&self, refname: &str) -> Option<ObjectId> {
        self.refs
            .iter()
            .find(|(name, _)| name == refname)
            .map(|(_, id)| *id)
    }

    /// Whether the server announced `capability` (with or without a value).
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|cap| cap == capability || cap.split_once('=').is_some_and(|(k, _)| k == capability))
    }

    /// Target of the `symref=HEAD:<ref>` capability.
    fn head_symref(&self) -> Option<&str> {
        self.capabilities
            .iter()
            .find_map(|cap| cap.strip_prefix("symref=HEAD:"))
    }

    /// Branch a clone should check out, with its tip.
    ///
    /// Prefers the `HEAD` symref, then a branch matching `HEAD`'s id, then
    /// `main`, `master` and finally the first advertised branch.
    pub fn default_branch(&self) -> Option<(String, ObjectId)> {
        let branch = |name: &str| self.get(name).map(|id| (name.to_string(), id));
        if let Some(found) = self.head_symref().and_then(branch) {
            return Some(found);
        }
        let heads = || self.refs.iter().filter(|(name, _)| name.starts_with("refs/heads/"));
        if let Some(head) = self.get("HEAD")
            && let Some((name, id)) = heads().find(|(_, id)| *id == head)
        {
            return Some((name.clone(), *id));
        }
        branch("refs/heads/main")
            .or_else(|| branch("refs/heads/master"))
            .or_else(|| heads().next().cloned())
    }
}

/// Side-band channel carrying pack or report data.
const BAND_DATA: u8 = 1;
/// Side-band channel carrying progress text.
const BAND_PROGRESS: u8 = 2;
/// Side-band channel carrying a fatal error.
const BAND_ERROR: u8 = 3;

/// Reassemble the data channel of a side-band stream.
fn demux_sideband(reader: &mut PktReader<'_>) -> RemoteResult<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        match reader.next_pkt().map_err(|e| RemoteError::protocol(&e))? {
            Some(PktLine::Data(data)) => match data.split_first() {
                Some((&BAND_DATA, payload)) => out.extend_from_slice(payload),
                Some((&BAND_PROGRESS, _)) => {}
                Some((&BAND_ERROR, message)) => {
                    return Err(RemoteError::Transport(format!(
                        "remote error: {}",
                        String::from_utf8_lossy(trim_newline(message))
                    )));
                }
                _ => {
                    return Err(RemoteError::Protocol(
                        "invalid side-band packet".to_string(),
                    ));
                }
            },
            Some(PktLine::Flush) | None => return Ok(out),
            Some(other) => {
                return Err(RemoteError::Protocol(format!(
                    "unexpected {other:?} packet in side-band stream"
                )));
            }
        }
    }
}

/// Pick the capabilities we want from those the server offers.
fn request_capabilities(advertisement: &Advertisement, wanted: &[&str]) -> String {
    let mut caps: Vec<&str> = wanted
        .iter()
        .copied()
        .filter(|cap| advertisement.has_capability(cap))
        .collect();
    caps.push(AGENT);
    caps.join(" ")
}

/// Fetch the default branch from an upload-pack exchange.
pub fn fetch(exchange: &mut dyn Exchange) -> RemoteResult<Fetched> {
    let raw = exchange
        .advertisement()
        .map_err(|e| RemoteError::transport(&e))?;
    let advertisement = Advertisement::parse(&raw).map_err(|e| RemoteError::protocol(&e))?;
    let Some((branch, tip)) = advertisement.default_branch() else {
        // Tell the server we want nothing.
        exchange.finish(FLUSH).ok();
        return Err(RemoteError::EmptyRepository);
    };

    let sideband = advertisement.has_capability("side-band-64k");
    let caps = request_capabilities(
        &advertisement,
        &["side-band-64k", "ofs-delta", "no-progress"],
    );
    let request = build_fetch_request(tip, &caps).map_err(|e| RemoteError::protocol(&e))?;

    let response = exchange
        .finish(&request)
        .map_err(|e| RemoteError::transport(&e))?;
    let pack = read_fetch_response(&response, sideband)?;
    let objects = parse_pack(&pack)
        .context("invalid pack received")
        .map_err(|e| RemoteError::protocol(&e))?;
    Ok(Fetched {
        branch,
        tip,
        objects,
    })
}

/// Encode a request for everything reachable from `tip`.
fn build_fetch_request(tip: ObjectId, caps: &str) -> Result<Vec<u8>> {
    let mut request = Vec::new();
    push_data(&mut request, format!("want {tip} {caps}\n").as_bytes())?;
    request.extend_from_slice(FLUSH);
    push_data(&mut request, b"done\n")?;
    Ok(request)
}

/// Extract the pack from an upload-pack response.
fn read_fetch_response(response: &[u8], sideband: bool) -> RemoteResult<Vec<u8>> {
    let mut reader = PktReader::new(response);
    match reader.next_pkt().map_err(|e| RemoteError::protocol(&e))? {
        Some(PktLine::Data(line)) if trim_newline(&line) == b"NAK" => {}
        Some(PktLine::Data(line)) if line.starts_with(b"ERR ") => {
            return Err(RemoteError::Transport(format!(
                "remote error: {}",
                String::from_utf8_lossy(trim_newline(&line[4..]))
            )));
        }
        other => {
            return Err(RemoteError::Protocol(format!(
                "expected NAK from upload-pack, got {other:?}"
            )));
        }
    }
    if sideband {
        demux_sideband(&mut reader)
    } else {
        Ok(reader.remaining().to_vec())
    }
}

/// Push `objects` and apply `update` through a receive-pack exchange.
pub fn push(exchange: &mut dyn Exchange, update: &RefUpdate, objects: &[Object]) -> RemoteResult<()> {
    let raw = exchange
        .advertisement()
        .map_err(|e| RemoteError::transport(&e))?;
    let advertisement = Advertisement::parse(&raw).map_err(|e| RemoteError::protocol(&e))?;
    if let Err(err) = update.check_fast_forward(advertisement.get(&update.refname)) {
        exchange.finish(FLUSH).ok();
        return Err(err);
    }

    let sideband = advertisement.has_capability("side-band-64k");
    let caps = request_capabilities(&advertisement, &["report-status", "side-band-64k"]);
    let request = build_push_request(update, objects, &caps).map_err(|e| RemoteError::protocol(&e))?;
    let response = exchange
        .finish(&request)
        .map_err(|e| RemoteError::transport(&e))?;

    if !advertisement.has_capability("report-status") {
        return Ok(());
    }
    let report = if sideband {
        demux_sideband(&mut PktReader::new(&response))?
    } else {
        response
    };
    check_report(&report, update)
}

/// Encode the command list and pack of a push.
fn build_push_request(update: &RefUpdate, objects: &[Object], caps: &str) -> Result<Vec<u8>> {
    let mut request = Vec::new();
    let command = format!("{} {} {}\0{caps}", update.old, update.new, update.refname);
    push_data(&mut request, command.as_bytes())?;
    request.extend_from_slice(FLUSH);
    request.extend(write_pack(objects)?);
    Ok(request)
}

/// Interpret a `report-status` response.
fn check_report(report: &[u8], update: &RefUpdate) -> RemoteResult<()> {
    let refname = update.refname.as_str();
    let lines = PktReader::new(report)
        .read_section()
        .map_err(|e| RemoteError::protocol(&e))?;
    let mut lines = lines.iter().map(|line| String::from_utf8_lossy(trim_newline(line)));

    let unpack = lines
        .next()
        .ok_or_else(|| RemoteError::Protocol("empty push report".to_string()))?;
    if unpack != "unpack ok" {
        let reason = unpack.strip_prefix("unpack ").unwrap_or(&unpack);
        return Err(RemoteError::Rejected {
            refname: refname.to_string(),
            reason: format!("unpack failed: {reason}"),
        });
    }

    for line in lines {
        if let Some(name) = line.strip_prefix("ok ") {
            if name == refname {
                return Ok(());
            }
        } else if let Some(rest) = line.strip_prefix("ng ") {
            let (name, reason) = rest.split_once(' ').unwrap_or((rest, "rejected"));
            if name != refname {
                continue;
            }
            if ["non-fast-forward", "fetch first", "stale info"]
                .iter()
                .any(|marker| reason.contains(marker))
            {
                return Err(RemoteError::NonFastForward {
                    refname: refname.to_string(),
                    expected: update.old,
                    found: None,
                });
            }
            return Err(RemoteError::Rejected {
                refname: refname.to_string(),
                reason: reason.to_string(),
            });
        }
    }
    Err(RemoteError::Protocol(format!(
        "push report does not mention {refname}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::encode_data;

    const TIP: &str = "ce013625030ba8dba906f756967f9e9ca394464a";
    const OTHER: &str = "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391";

    fn advertise(lines: &[String]) -> Vec<u8> {
        let mut out = Vec::new();
        for line in lines {
            out.extend(encode_data(line.as_bytes()).unwrap());
        }
        out.extend_from_slice(FLUSH);
        out
    }

    #[test]
    fn parses_refs_and_symref() {
        let raw = advertise(&[
            format!("{TIP} HEAD\0multi_ack side-band-64k symref=HEAD:refs/heads/trunk agent=git/2\n"),
            format!("{OTHER} refs/heads/main\n"),
            format!("{TIP} refs/heads/trunk\n"),
            format!("{OTHER} refs/tags/v1^{{}}\n"),
        ]);
        let adv = Advertisement::parse(&raw).unwrap();
        assert!(adv.has_capability("side-band-64k"));
        assert!(adv.has_capability("agent"));
        assert!(!adv.has_capability("ofs-delta"));
        assert_eq!(
            adv.default_branch(),
            Some(("refs/heads/trunk".to_string(), TIP.parse().unwrap()))
        );
        assert_eq!(adv.get("refs/tags/v1"), None);
    }

    #[test]
    fn default_branch_falls_back_to_head_id_then_main() {
        let raw = advertise(&[
            format!("{TIP} HEAD\0side-band\n"),
            format!("{OTHER} refs/heads/main\n"),
            format!("{TIP} refs/heads/feature\n"),
        ]);
        let adv = Advertisement::parse(&raw).unwrap();
        assert_eq!(adv.default_branch().unwrap().0, "refs/heads/feature");

        let raw = advertise(&[
            format!("{TIP} refs/heads/dev\0side-band\n"),
            format!("{OTHER} refs/heads/master\n"),
        ]);
        let adv = Advertisement::parse(&raw).unwrap();
        assert_eq!(adv.default_branch().unwrap().0, "refs/heads/master");
    }

    #[test]
    fn empty_repository_has_no_branch() {
        let zero = ObjectId::ZERO;
        let raw = advertise(&[format!("{zero} capabilities^{{}}\0report-status\n")]);
        let adv = Advertisement::parse(&raw).unwrap();
        assert!(adv.has_capability("report-status"));
        assert_eq!(adv.default_branch(), None);
    }

    #[test]
    fn server_errors_surface() {
        let raw = advertise(&["ERR access denied\n".to_string()]);
        let err = Advertisement::parse(&raw).unwrap_err();
        assert!(format!("{err:#}").contains("access denied"));
    }

    fn report(lines: &[&str]) -> Vec<u8> {
        let lines: Vec<String> = lines.iter().map(|l| format!("{l}\n")).collect();
        advertise(&lines)
    }

    #[test]
    fn report_status_outcomes() {
        let refname = &RefUpdate {
            refname: "refs/heads/main".to_string(),
            old: TIP.parse().unwrap(),
            new: OTHER.parse().unwrap(),
        };
        assert!(check_report(&report(&["unpack ok", "ok refs/heads/main"]), refname).is_ok());
        assert!(matches!(
            check_report(&report(&["unpack ok", "ng refs/heads/main fetch first"]), refname),
            Err(RemoteError::NonFastForward { .. })
        ));
        assert!(matches!(
            check_report(&report(&["unpack ok", "ng refs/heads/main hook declined"]), refname),
            Err(RemoteError::Rejected { reason, .. }) if reason == "hook declined"
        ));
        assert!(matches!(
            check_report(&report(&["unpack index-pack failed"]), refname),
            Err(RemoteError::Rejected { .. })
        ));
        assert!(matches!(
            check_report(&report(&["unpack ok"]), refname),
            Err(RemoteError::Protocol(_))
        ));
    }

    #[test]
    fn sideband_demux_collects_data_channel() {
        let mut wire = Vec::new();
        wire.extend(encode_data(b"\x02progress").unwrap());
        wire.extend(encode_data(b"\x01PA").unwrap());
        wire.extend(encode_data(b"\x01CK").unwrap());
        wire.extend_from_slice(FLUSH);
        assert_eq!(demux_sideband(&mut PktReader::new(&wire)).unwrap(), b"PACK");

        let mut wire = Vec::new();
        wire.extend(encode_data(b"\x03disk full\n").unwrap());
        assert!(matches!(
            demux_sideband(&mut PktReader::new(&wire)),
            Err(RemoteError::Transport(msg)) if msg.contains("disk full")
        ));
    }

    #[test]
    fn fetch_response_requires_nak() {
        let mut wire = encode_data(b"NAK\n").unwrap();
        wire.extend_from_slice(b"PACKDATA");
        assert_eq!(read_fetch_response(&wire, false).unwrap(), b"PACKDATA");
        assert!(read_fetch_response(b"0008ACK\n", false).is_err());
    }
}
