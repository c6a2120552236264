use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use super::matrix::TestCase;
use super::signature::{canonicalize, Signature};
use super::transport::{Transport, TransportError};
use super::wire::{build_query, QuerySpec, ResponseHeader};

const LABEL_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const LABEL_LENGTH: usize = 12;

/// Fresh 12-character label so that no two probes share a cache entry.
pub fn random_label() -> String {
    let mut rng = rand::thread_rng();
    (0..LABEL_LENGTH)
        .map(|_| LABEL_CHARSET[rng.gen_range(0..LABEL_CHARSET.len())] as char)
        .collect()
}

/// Send exactly one query for `case` and turn whatever happens into a signature.
///
/// Never retries and never fails: timeouts, transport errors and unparsable
/// responses all come back as `Signature::Failure`.
pub async fn probe_once(
    transport: &dyn Transport,
    server: SocketAddr,
    case: &TestCase,
    wait: Duration,
) -> Signature {
    let qname = case.query_name(&random_label());
    let query = match build_query(&QuerySpec {
        id: rand::random(),
        qname: &qname,
        record_type: case.record_type,
        class: case.class,
        opcode: case.opcode,
        flags: &case.flags,
    }) {
        Ok(query) => query,
        Err(e) => return Signature::failure(e.to_string()),
    };

    let signature = match transport.exchange(server, &query, wait).await {
        Ok(response) => match ResponseHeader::parse(&response) {
            Ok(header) => canonicalize(&header),
            Err(e) => Signature::failure(e.to_string()),
        },
        Err(TransportError::Timeout) => Signature::timeout(),
        Err(e) => Signature::failure(e.to_string()),
    };

    if let Signature::Failure { reason } = &signature {
        debug!("probe {} -> {} failed: {}", case.name, server, reason);
    }
    signature
}
