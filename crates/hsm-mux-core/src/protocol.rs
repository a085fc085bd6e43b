//! Numeric vocabulary of the device RPC protocol: operation codes, result
//! codes, key types and key flags. Values are fixed by the device firmware and
//! must not be renumbered.

use std::fmt;

/// Operation code carried on the reader-loop channel when a device connection
/// fails. Never assigned to a real operation.
pub const TRANSPORT_FAILURE_CODE: u32 = 0xFFFF_FFFF;

macro_rules! rpc_functions {
    ($($variant:ident = $code:literal => $name:literal,)+) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum RpcFunc {
            $($variant = $code,)+
        }

        impl RpcFunc {
            pub const ALL: &'static [RpcFunc] = &[$(RpcFunc::$variant,)+];

            pub fn from_code(code: u32) -> Option<Self> {
                match code {
                    $($code => Some(RpcFunc::$variant),)+
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(RpcFunc::$variant => $name,)+
                }
            }
        }
    };
}

rpc_functions! {
    GetVersion = 0 => "get_version",
    GetRandom = 1 => "get_random",
    SetPin = 2 => "set_pin",
    Login = 3 => "login",
    Logout = 4 => "logout",
    LogoutAll = 5 => "logout_all",
    IsLoggedIn = 6 => "is_logged_in",
    HashGetDigestLen = 7 => "hash_get_digest_len",
    HashGetDigestAlgorithmId = 8 => "hash_get_digest_algorithm_id",
    HashGetAlgorithm = 9 => "hash_get_algorithm",
    HashInitialize = 10 => "hash_initialize",
    HashUpdate = 11 => "hash_update",
    HashFinalize = 12 => "hash_finalize",
    PkeyLoad = 13 => "pkey_load",
    PkeyOpen = 14 => "pkey_open",
    PkeyGenerateRsa = 15 => "pkey_generate_rsa",
    PkeyGenerateEc = 16 => "pkey_generate_ec",
    PkeyClose = 17 => "pkey_close",
    PkeyDelete = 18 => "pkey_delete",
    PkeyGetKeyType = 19 => "pkey_get_key_type",
    PkeyGetKeyFlags = 20 => "pkey_get_key_flags",
    PkeyGetPublicKeyLen = 21 => "pkey_get_public_key_len",
    PkeyGetPublicKey = 22 => "pkey_get_public_key",
    PkeySign = 23 => "pkey_sign",
    PkeyVerify = 24 => "pkey_verify",
    PkeyMatch = 25 => "pkey_match",
    PkeyGetKeyCurve = 26 => "pkey_get_key_curve",
    PkeySetAttributes = 27 => "pkey_set_attributes",
    PkeyGetAttributes = 28 => "pkey_get_attributes",
    PkeyExport = 29 => "pkey_export",
    PkeyImport = 30 => "pkey_import",
    PkeyGenerateHashsig = 31 => "pkey_generate_hashsig",
    CheckTamper = 66 => "check_tamper",
    GetHsmState = 1979 => "get_hsm_state",
    GetIp = 1980 => "get_ip",
    SetRpcDevice = 1981 => "set_rpc_device",
    DisableCacheKeygen = 1982 => "disable_cache_keygen",
    EnableCacheKeygen = 1983 => "enable_cache_keygen",
    UseIncomingDeviceUuids = 1984 => "use_incoming_device_uuids",
    UseIncomingMasterUuids = 1985 => "use_incoming_master_uuids",
}

impl RpcFunc {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Operations that create a key on a device and report its identifier.
    pub fn creates_key(self) -> bool {
        matches!(
            self,
            RpcFunc::PkeyGenerateRsa
                | RpcFunc::PkeyGenerateEc
                | RpcFunc::PkeyGenerateHashsig
                | RpcFunc::PkeyLoad
                | RpcFunc::PkeyImport
        )
    }
}

impl fmt::Display for RpcFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result codes written at offset 8 of every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HalError {
    Ok = 0,
    BadArguments = 1,
    Impossible = 12,
    AllocationFailure = 13,
    KeyNotFound = 21,
    Forbidden = 26,
    RpcTransport = 28,
    MasterKeyNotSet = 32,
    AttributeNotFound = 40,
    NotReady = 49,
    Tamper = 50,
}

impl HalError {
    pub fn code(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum KeyType {
    None = 0,
    RsaPrivate = 1,
    RsaPublic = 2,
    EcPrivate = 3,
    EcPublic = 4,
    HashsigPrivate = 5,
    HashsigPublic = 6,
}

impl KeyType {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Private key type produced by a generate operation.
    pub fn generated_by(func: RpcFunc) -> Option<Self> {
        match func {
            RpcFunc::PkeyGenerateRsa => Some(KeyType::RsaPrivate),
            RpcFunc::PkeyGenerateEc => Some(KeyType::EcPrivate),
            RpcFunc::PkeyGenerateHashsig => Some(KeyType::HashsigPrivate),
            _ => None,
        }
    }

    pub fn public_counterpart(self) -> Option<Self> {
        match self {
            KeyType::RsaPrivate => Some(KeyType::RsaPublic),
            KeyType::EcPrivate => Some(KeyType::EcPublic),
            KeyType::HashsigPrivate => Some(KeyType::HashsigPublic),
            _ => None,
        }
    }
}

pub mod key_flags {
    pub const USAGE_DIGITAL_SIGNATURE: u32 = 1 << 0;
    pub const USAGE_KEY_ENCIPHERMENT: u32 = 1 << 1;
    pub const USAGE_DATA_ENCIPHERMENT: u32 = 1 << 2;
    pub const TOKEN: u32 = 1 << 3;
    pub const PUBLIC: u32 = 1 << 4;
    pub const EXPORTABLE: u32 = 1 << 5;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_resolve_to_functions() {
        for func in RpcFunc::ALL {
            assert_eq!(RpcFunc::from_code(func.code()), Some(*func));
        }
        assert_eq!(RpcFunc::from_code(32), None);
        assert_eq!(RpcFunc::from_code(TRANSPORT_FAILURE_CODE), None);
    }

    #[test]
    fn private_types_have_public_counterparts() {
        assert_eq!(
            KeyType::generated_by(RpcFunc::PkeyGenerateEc).and_then(KeyType::public_counterpart),
            Some(KeyType::EcPublic)
        );
        assert_eq!(KeyType::RsaPublic.public_counterpart(), None);
        assert_eq!(KeyType::generated_by(RpcFunc::PkeyLoad), None);
    }
}
