// SPDX-License-Identifier: MIT OR Apache-2.0
//! The executor exit-code contract.
//!
//! Operation executors report their HTTP status through the process exit
//! code, compressed into the 0–99 range. The web front-end decodes it
//! back. Unknown statuses compress to 49, which decodes to 500; an exit
//! code of 0 decodes to 200 so a conventional success still reads as one.

/// Compress an HTTP status into an exit code.
pub fn http2exit(status: u16) -> i32 {
    match status {
        200 => 20,
        201 => 21,
        400 => 40,
        401 => 41,
        403 => 43,
        404 => 44,
        500 => 50,
        _ => 49,
    }
}

/// Decode an executor exit code back into an HTTP status.
pub fn exit2http(code: i32) -> u16 {
    match code {
        0 => 200,
        20 => 200,
        21 => 201,
        40 => 400,
        41 => 401,
        43 => 403,
        44 => 404,
        50 => 500,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_mapped_status() {
        for s in [200u16, 201, 400, 401, 403, 404, 500] {
            assert_eq!(exit2http(http2exit(s)), s);
        }
    }

    #[test]
    fn unknown_statuses_become_500() {
        assert_eq!(http2exit(418), 49);
        assert_eq!(exit2http(49), 500);
        assert_eq!(exit2http(99), 500);
    }

    #[test]
    fn conventional_success_reads_as_200() {
        assert_eq!(exit2http(0), 200);
    }
}
