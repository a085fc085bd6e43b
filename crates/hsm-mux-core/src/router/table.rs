use crate::protocol::RpcFunc;

/// How the router places an operation on the device pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Stateless; pinned device or load balanced.
    Any,
    /// Pinned device, else every device in turn.
    All,
    HashStart,
    /// Device recorded for the hash handle at offset 8.
    Hash,
    HashEnd,
    PkeyOpen,
    /// Device recorded for the key handle at offset 8.
    Pkey,
    /// Creates a key: generate, load or import.
    KeyCreate,
    PkeyMatch,
    PkeyExport,
    /// Pinned device, else the device of the current key operation.
    UseCurrent,
    /// Changes session routing; trusted sessions only.
    SessionSetting,
    DeviceState,
    DeviceIp,
}

impl Route {
    pub fn of(func: RpcFunc) -> Self {
        use RpcFunc::*;
        match func {
            GetVersion | GetRandom | HashGetDigestLen | HashGetDigestAlgorithmId => Route::Any,
            SetPin | Login | Logout | LogoutAll | IsLoggedIn => Route::All,
            HashInitialize => Route::HashStart,
            HashGetAlgorithm | HashUpdate => Route::Hash,
            HashFinalize => Route::HashEnd,
            PkeyOpen => Route::PkeyOpen,
            PkeyClose | PkeyDelete | PkeyGetKeyType | PkeyGetKeyCurve | PkeyGetKeyFlags
            | PkeyGetPublicKeyLen | PkeyGetPublicKey | PkeySign | PkeyVerify
            | PkeySetAttributes | PkeyGetAttributes => Route::Pkey,
            PkeyGenerateRsa | PkeyGenerateEc | PkeyGenerateHashsig | PkeyLoad | PkeyImport => {
                Route::KeyCreate
            }
            PkeyMatch => Route::PkeyMatch,
            PkeyExport => Route::PkeyExport,
            CheckTamper => Route::UseCurrent,
            SetRpcDevice | EnableCacheKeygen | DisableCacheKeygen | UseIncomingDeviceUuids
            | UseIncomingMasterUuids => Route::SessionSetting,
            GetHsmState => Route::DeviceState,
            GetIp => Route::DeviceIp,
        }
    }

    /// Broadcast failures do not stop the remaining devices.
    pub fn is_idempotent_broadcast(func: RpcFunc) -> bool {
        matches!(func, RpcFunc::Logout | RpcFunc::LogoutAll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_ops_share_one_route() {
        for func in RpcFunc::ALL {
            assert_eq!(Route::of(*func) == Route::KeyCreate, func.creates_key(), "{func}");
        }
    }

    #[test]
    fn handle_ops_route_by_handle() {
        assert_eq!(Route::of(RpcFunc::PkeySign), Route::Pkey);
        assert_eq!(Route::of(RpcFunc::HashUpdate), Route::Hash);
        assert_eq!(Route::of(RpcFunc::Login), Route::All);
        assert_eq!(Route::of(RpcFunc::GetRandom), Route::Any);
    }
}
