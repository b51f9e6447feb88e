//! Block headers and merkle proofs that anchor confirmations

use crate::ids::{BlockHeaderId, MerkleBlockId};
use bitcoin::block::{Header, Version};
use bitcoin::consensus::encode::{self, deserialize, serialize};
use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};
use thiserror::Error;

/// Height of a header whose position in the chain is not known.
pub const UNKNOWN_HEIGHT: u32 = u32::MAX;

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Invalid merkle block encoding: {0}")]
    Decode(#[from] encode::Error),
    #[error("Header {given} does not belong to this merkle block")]
    HeaderMismatch { given: BlockHash },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    id: Option<BlockHeaderId>,
    hash: BlockHash,
    height: u32,
    version: i32,
    prevhash: BlockHash,
    merkleroot: TxMerkleNode,
    timestamp: u32,
    bits: u32,
    nonce: u32,
}

impl BlockHeader {
    pub fn from_header(header: &Header, height: u32) -> Self {
        Self {
            id: None,
            hash: header.block_hash(),
            height,
            version: header.version.to_consensus(),
            prevhash: header.prev_blockhash,
            merkleroot: header.merkle_root,
            timestamp: header.time,
            bits: header.bits.to_consensus(),
            nonce: header.nonce,
        }
    }

    pub fn to_header(&self) -> Header {
        Header {
            version: Version::from_consensus(self.version),
            prev_blockhash: self.prevhash,
            merkle_root: self.merkleroot,
            time: self.timestamp,
            bits: CompactTarget::from_consensus(self.bits),
            nonce: self.nonce,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: BlockHeaderId,
        hash: BlockHash,
        height: u32,
        version: i32,
        prevhash: BlockHash,
        merkleroot: TxMerkleNode,
        timestamp: u32,
        bits: u32,
        nonce: u32,
    ) -> Self {
        Self {
            id: Some(id),
            hash,
            height,
            version,
            prevhash,
            merkleroot,
            timestamp,
            bits,
            nonce,
        }
    }

    pub(crate) fn set_id(&mut self, id: BlockHeaderId) {
        self.id = Some(id);
    }

    pub fn id(&self) -> Option<BlockHeaderId> {
        self.id
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn prevhash(&self) -> BlockHash {
        self.prevhash
    }

    pub fn merkleroot(&self) -> TxMerkleNode {
        self.merkleroot
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }
}

/// A BIP-37 partial merkle tree over one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlock {
    id: Option<MerkleBlockId>,
    blockheader: Option<BlockHeaderId>,
    txcount: u32,
    hashes: Vec<TxMerkleNode>,
    /// Traversal bits, packed LSB-first
    flags: Vec<u8>,
}

impl MerkleBlock {
    pub fn new(txcount: u32, hashes: Vec<TxMerkleNode>, flags: Vec<u8>) -> Self {
        Self {
            id: None,
            blockheader: None,
            txcount,
            hashes,
            flags,
        }
    }

    /// Split into the header record and the tree. The header reference is
    /// filled in when both are stored.
    pub fn from_merkle_block(merkle_block: &bitcoin::MerkleBlock, height: u32) -> (BlockHeader, Self) {
        let tree = &merkle_block.txn;
        let bits = tree.bits();
        let mut flags = vec![0u8; bits.len().div_ceil(8)];
        for (i, bit) in bits.iter().enumerate() {
            if *bit {
                flags[i / 8] |= 1 << (i % 8);
            }
        }

        let header = BlockHeader::from_header(&merkle_block.header, height);
        let tree = Self::new(tree.num_transactions(), tree.hashes().clone(), flags);
        (header, tree)
    }

    pub fn to_merkle_block(&self, header: &BlockHeader) -> Result<bitcoin::MerkleBlock, BlockError> {
        if self.blockheader.is_some() && self.blockheader != header.id {
            return Err(BlockError::HeaderMismatch { given: header.hash });
        }
        let mut bytes = serialize(&header.to_header());
        bytes.extend(serialize(&self.txcount));
        bytes.extend(serialize(&self.hashes));
        bytes.extend(serialize(&self.flags));
        Ok(deserialize(&bytes)?)
    }

    pub(crate) fn from_parts(
        id: MerkleBlockId,
        blockheader: BlockHeaderId,
        txcount: u32,
        hashes: Vec<TxMerkleNode>,
        flags: Vec<u8>,
    ) -> Self {
        Self {
            id: Some(id),
            blockheader: Some(blockheader),
            txcount,
            hashes,
            flags,
        }
    }

    pub(crate) fn set_id(&mut self, id: MerkleBlockId) {
        self.id = Some(id);
    }

    pub(crate) fn set_blockheader(&mut self, header: BlockHeaderId) {
        self.blockheader = Some(header);
    }

    pub fn id(&self) -> Option<MerkleBlockId> {
        self.id
    }

    pub fn blockheader(&self) -> Option<BlockHeaderId> {
        self.blockheader
    }

    pub fn txcount(&self) -> u32 {
        self.txcount
    }

    pub fn hashes(&self) -> &[TxMerkleNode] {
        &self.hashes
    }

    pub fn flags(&self) -> &[u8] {
        &self.flags
    }
}
