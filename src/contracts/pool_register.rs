use ethers::prelude::*;

// Protocol pool register: the on-chain enumeration of every market the
// protocol runs on a chain. Chains without a working register are served by
// the static list in the pool fetcher instead.

abigen!(
    PoolRegister,
    r#"[
        {
            "inputs": [],
            "name": "getPools",
            "outputs": [{ "internalType": "address[]", "name": "", "type": "address[]" }],
            "stateMutability": "view",
            "type": "function"
        },
        {
            "inputs": [{ "internalType": "address", "name": "pool", "type": "address" }],
            "name": "isPool",
            "outputs": [{ "internalType": "bool", "name": "", "type": "bool" }],
            "stateMutability": "view",
            "type": "function"
        }
    ]"#
);
