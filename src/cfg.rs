macro_rules! cfg_feature {
    (
        #![$meta:meta]
        $($item:item)*
    ) => {
        $(
            #[cfg($meta)]
            #[cfg_attr(docsrs, doc(cfg($meta)))]
            $item
        )*
    }
}

macro_rules! cfg_proto {
    ($($item:item)*) => {
        cfg_feature! {
            #![any(feature = "http1", feature = "http2", feature = "http3")]
            $($item)*
        }
    }
}

cfg_proto! {
    macro_rules! cfg_http1 {
        ($($item:item)*) => {
            $(
                #[cfg(feature = "http1")]
                #[cfg_attr(docsrs, doc(cfg(feature = "http1")))]
                $item
            )*
        }
    }

    macro_rules! cfg_http2 {
        ($($item:item)*) => {
            $(
                #[cfg(feature = "http2")]
                #[cfg_attr(docsrs, doc(cfg(feature = "http2")))]
                $item
            )*
        }
    }

    macro_rules! cfg_http3 {
        ($($item:item)*) => {
            $(
                #[cfg(feature = "http3")]
                #[cfg_attr(docsrs, doc(cfg(feature = "http3")))]
                $item
            )*
        }
    }
}
