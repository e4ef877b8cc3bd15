//! Persisted routing table snapshot: one base64 peer address per line.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;

use tracing::debug;

use crate::common::{Peer, PeerAddress};

const HEADER: &str = "# Known DHT peers, one base64 encoded address per line.\n";

/// Read peer addresses, ignoring blank lines, `#` comments and invalid lines.
///
/// A missing file is an empty list.
pub fn read(path: &Path) -> io::Result<Vec<PeerAddress>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error),
    };

    Ok(parse(&content))
}

/// Write peers unlocked first, newest first within each group.
pub fn write(path: &Path, peers: &[Peer]) -> io::Result<()> {
    let mut sorted: Vec<&Peer> = peers.iter().collect();
    sort_for_persistence(&mut sorted);

    let mut content = String::from(HEADER);
    for peer in sorted {
        content.push_str(&peer.address().to_base64());
        content.push('\n');
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    fs::write(path, content)
}

fn parse(content: &str) -> Vec<PeerAddress> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match PeerAddress::from_base64(line) {
            Ok(address) => Some(address),
            Err(error) => {
                debug!(?error, "Skipping invalid line in peer file");
                None
            }
        })
        .collect()
}

fn sort_for_persistence(peers: &mut [&Peer]) {
    peers.sort_by(|a, b| {
        a.is_locked()
            .cmp(&b.is_locked())
            .then_with(|| b.first_seen().cmp(&a.first_seen()))
    });
}

#[cfg(test)]
mod test {
    use std::thread::sleep;
    use std::time::Duration;

    use super::*;
    use crate::common::LOCK_THRESHOLD;

    fn address(name: &str) -> PeerAddress {
        PeerAddress::new(name.as_bytes().to_vec())
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let content = format!(
            "# comment\n\n{}\n   \n#{}\nnot base64!\n{}\n",
            address("a").to_base64(),
            address("ignored").to_base64(),
            address("b").to_base64(),
        );

        assert_eq!(parse(&content), vec![address("a"), address("b")]);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();

        assert!(read(&dir.path().join("peers.txt")).unwrap().is_empty());
    }

    #[test]
    fn writes_unlocked_and_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("peers.txt");

        let oldest = Peer::new(address("oldest"));
        sleep(Duration::from_millis(2));
        let mut locked = Peer::new(address("locked"));
        for _ in 0..LOCK_THRESHOLD {
            locked.no_response();
        }
        sleep(Duration::from_millis(2));
        let newest = Peer::new(address("newest"));

        write(&path, &[oldest, locked, newest]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with('#'));

        assert_eq!(
            read(&path).unwrap(),
            vec![address("newest"), address("oldest"), address("locked")]
        );
    }
}
