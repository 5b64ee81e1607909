/*! Buffer views shared by all protocol layers.

 - [BufNode] and [BufRef] form a zero-copy chained view over byte spans,
   possibly circular, used to carry packet data between layers without
   copying.
 - [Ring] provides the modular-arithmetic bookkeeping for the user-owned
   send and receive buffers the TCP engine borrows.

[BufNode]: struct.BufNode.html
[BufRef]: struct.BufRef.html
[Ring]: struct.Ring.html
*/

mod buf;
mod ring;

pub use self::buf::{BufChunks, BufNode, BufRef, Link};
pub use self::ring::Ring;
